use crate::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use chorus::{errors::ChorusError, models::event::OutputEnvelope};
use futures::{
    stream::{BoxStream, StreamExt},
    Stream,
};
use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    convert::Infallible,
    pin::Pin,
    task::{Context, Poll},
};

#[derive(Debug, Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    /// Backend ids to ask; every backend when absent or empty
    #[serde(default)]
    windows: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Server-sent events carrying one envelope each
pub struct SseResponse {
    rx: BoxStream<'static, String>,
}

impl SseResponse {
    fn new(rx: BoxStream<'static, String>) -> Self {
        Self { rx }
    }
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx
            .as_mut()
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);
        (
            [
                (CONTENT_TYPE, "text/event-stream"),
                (CACHE_CONTROL, "no-cache"),
                (CONNECTION, "keep-alive"),
            ],
            body,
        )
            .into_response()
    }
}

/// `data: {"model": <label>, "event": <kind>, "chunk": <text>}`
pub fn format_sse_message(envelope: &OutputEnvelope) -> String {
    let data = json!({
        "model": envelope.source,
        "event": envelope.payload.kind(),
        "chunk": envelope.payload.render().unwrap_or_default(),
    });
    format!("data: {}\n\n", data)
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<SseResponse, (StatusCode, Json<ErrorResponse>)> {
    let merged = state
        .orchestrator
        .handle_turn(&request.message, request.windows.as_deref())
        .map_err(|e| match e {
            ChorusError::InvalidRequest(error) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { error }))
            }
            other => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: other.to_string(),
                }),
            ),
        })?;

    // Dropping the body on client disconnect cancels every backend
    let lines = merged.map(|envelope| format_sse_message(&envelope)).boxed();
    Ok(SseResponse::new(lines))
}

// Configure routes for this module
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/chat-stream", post(chat_stream))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{orchestrator, FixedAdapter};
    use axum::{body::Body, http::Request};
    use chorus::models::event::Event;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        let ollama = Arc::new(FixedAdapter::new(vec![Event::text("Hi"), Event::End]));
        let openai = Arc::new(FixedAdapter::new(vec![
            Event::tool_invoked("brave_web_search"),
            Event::error("Server error: 503"),
        ]));
        let state = AppState::new(orchestrator(vec![
            ("llama", "response1", ollama),
            ("openai", "response3", openai),
        ]));
        routes(state)
    }

    fn chat_request(body: Value) -> Request<Body> {
        Request::builder()
            .uri("/chat-stream")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn data_lines(response: Response) -> Vec<Value> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec())
            .unwrap()
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| serde_json::from_str::<Value>(frame.trim_start_matches("data: ")).unwrap())
            .collect()
    }

    #[test]
    fn test_format_sse_message() {
        let envelope = OutputEnvelope::new("response2", Event::tool_invoked("search"));
        let message = format_sse_message(&envelope);
        assert!(message.starts_with("data: "));
        assert!(message.ends_with("\n\n"));

        let data: Value = serde_json::from_str(message.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(
            data,
            json!({"model": "response2", "event": "tool_invoked", "chunk": "\n[Using tool: search]\n"})
        );
    }

    #[tokio::test]
    async fn test_chat_stream_merges_backends() {
        let response = app()
            .oneshot(chat_request(json!({"message": "hello"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");

        let lines = data_lines(response).await;
        let ollama: Vec<&Value> = lines.iter().filter(|l| l["model"] == "response1").collect();
        let openai: Vec<&Value> = lines.iter().filter(|l| l["model"] == "response3").collect();

        assert_eq!(lines.len(), 4);
        assert_eq!(ollama[0]["chunk"], "Hi");
        assert_eq!(ollama[1]["event"], "end");
        assert_eq!(openai[0]["chunk"], "\n[Using tool: brave_web_search]\n");
        assert_eq!(openai[1]["chunk"], "Error: Server error: 503");
    }

    #[tokio::test]
    async fn test_chat_stream_selected_windows() {
        let response = app()
            .oneshot(chat_request(json!({"message": "hello", "windows": ["openai"]})))
            .await
            .unwrap();

        let lines = data_lines(response).await;
        assert!(lines.iter().all(|l| l["model"] == "response3"));
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn test_chat_stream_local_backend_window() {
        let response = app()
            .oneshot(chat_request(json!({"message": "hello", "windows": ["llama"]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let lines = data_lines(response).await;
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l["model"] == "response1"));
        assert_eq!(lines[0]["chunk"], "Hi");
    }

    #[tokio::test]
    async fn test_chat_stream_rejects_invalid_requests() {
        let missing = app().oneshot(chat_request(json!({}))).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let unknown = app()
            .oneshot(chat_request(json!({"message": "hello", "windows": ["gemini"]})))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
        let body = unknown.into_body().collect().await.unwrap().to_bytes();
        let error: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(error["error"], "No valid backend ids provided");
    }
}
