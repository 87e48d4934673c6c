use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::{stream, try_stream};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::base::{run_tool, summarize_tool_result, AdapterSession, ProviderAdapter};
use super::configs::OpenAiProviderConfig;
use super::factory::BackendKind;
use super::utils::{
    error_from_response, is_valid_function_name, messages_to_openai_spec, sse_data_stream,
    tools_to_openai_spec, ToolCallAccumulator,
};
use crate::capability::CapabilityProvider;
use crate::errors::{ProviderError, ToolError};
use crate::models::event::Event;
use crate::models::message::Message;
use crate::models::tool::ToolCall;
use crate::session::Conversation;

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: Option<u32>,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, PartialEq)]
enum OpenAiChunk {
    Text(String),
    /// Sent once at the end with every tool call reassembled from its fragments
    Complete {
        finish_reason: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
}

fn openai_chunks<S>(events: S) -> impl Stream<Item = Result<OpenAiChunk, ProviderError>> + Send
where
    S: Stream<Item = Result<String, ProviderError>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(events);
        let mut tool_calls = ToolCallAccumulator::new();
        let mut finish_reason = None;

        while let Some(data) = events.next().await {
            let data = data?;
            if data.trim() == "[DONE]" {
                break;
            }
            let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Skipping undecodable OpenAI chunk ({}): {}", e, data);
                    continue;
                }
            };
            if let Some(error) = chunk.error {
                Err::<(), _>(ProviderError::Stream(error.message))?;
            }

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content {
                    yield OpenAiChunk::Text(text);
                }
                for fragment in choice.delta.tool_calls.unwrap_or_default() {
                    let (name, arguments) = match fragment.function {
                        Some(function) => (function.name, function.arguments),
                        None => (None, None),
                    };
                    tool_calls.push(
                        fragment.index.unwrap_or(0),
                        fragment.id.as_deref(),
                        name.as_deref(),
                        arguments.as_deref(),
                    );
                }
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason;
                }
            }
        }

        yield OpenAiChunk::Complete {
            finish_reason,
            tool_calls: tool_calls.finish(),
        };
    }
}

/// Adapter for OpenAI's streaming chat completions, where tool calls arrive
/// as argument fragments keyed by index.
pub struct OpenAiAdapter {
    client: Client,
    config: OpenAiProviderConfig,
    session: AdapterSession<Vec<Value>>,
}

impl OpenAiAdapter {
    pub fn new(
        config: OpenAiProviderConfig,
        system_prompt: &str,
        capability: Option<Arc<dyn CapabilityProvider>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self {
            client,
            config,
            session: AdapterSession::new(BackendKind::OpenAi, system_prompt, capability),
        })
    }

    fn payload(&self, system: &str, messages: &[Message], tools: &[Value]) -> Value {
        let mut payload = json!({
            "model": self.config.model,
            "messages": messages_to_openai_spec(system, messages),
            "stream": true,
        });
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!("auto");
        }
        if let Some(temperature) = self.config.temperature {
            payload["temperature"] = json!(temperature);
        }
        payload
    }

    async fn stream(
        &self,
        payload: Value,
    ) -> Result<impl Stream<Item = Result<OpenAiChunk, ProviderError>> + Send, ProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(openai_chunks(sse_data_stream(response.bytes_stream())))
    }
}

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAi
    }

    fn initiate_turn(self: Arc<Self>, user_message: String) -> BoxStream<'static, Event> {
        Box::pin(stream! {
            let mut turn = match self.session.begin_turn(&user_message).await {
                Ok(turn) => turn,
                Err(e) => {
                    yield Event::error(e.to_string());
                    return;
                }
            };
            let tools = match self.session.tools(tools_to_openai_spec).await {
                Ok(tools) => tools,
                Err(e) => {
                    yield turn.fail(format!("Failed to load tools: {}", e));
                    return;
                }
            };

            let conversation = self.session.conversation().snapshot();
            let system = conversation.system_prompt();
            let opened = match self.stream(self.payload(system, conversation.history(), &tools.wire)).await {
                Err(e) if e.is_request_rejection() && !tools.wire.is_empty() => {
                    warn!("OpenAI rejected the request with tools attached ({}), retrying without tools", e);
                    self.stream(self.payload(system, conversation.history(), &[])).await
                }
                opened => opened,
            };
            let chunks = match opened {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield turn.fail(e);
                    return;
                }
            };
            futures::pin_mut!(chunks);

            let mut tool_calls = Vec::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(OpenAiChunk::Text(text)) => {
                        if let Some(event) = turn.emit_text(&text) {
                            yield event;
                        }
                    }
                    Ok(OpenAiChunk::Complete { finish_reason, tool_calls: calls }) => {
                        debug!("OpenAI stream finished: {:?}", finish_reason);
                        tool_calls = calls;
                    }
                    Err(e) => {
                        yield turn.fail(e);
                        return;
                    }
                }
            }

            if tool_calls.is_empty() {
                yield turn.finish();
                return;
            }

            info!("OpenAI requested {} tool call(s)", tool_calls.len());
            let capability = self.session.capability();
            let mut exchange = Vec::new();
            for call in tool_calls {
                yield Event::tool_invoked(&call.name);
                let result = if is_valid_function_name(&call.name) {
                    run_tool(capability.as_deref(), &call).await
                } else {
                    Err(ToolError::ToolNotFound(format!(
                        "The provided function name '{}' had invalid characters, it must match this regex [a-zA-Z0-9_-]+",
                        call.name
                    )))
                };
                yield Event::tool_result(&call.name, summarize_tool_result(&result));
                exchange.push((call, result));
            }
            turn.record_tool_exchange(exchange);

            // The follow-up goes without tools so the model answers from the results
            let conversation = self.session.conversation().snapshot();
            let payload = self.payload(conversation.system_prompt(), conversation.history(), &[]);
            let chunks = match self.stream(payload).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield turn.fail(e);
                    return;
                }
            };
            futures::pin_mut!(chunks);

            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(OpenAiChunk::Text(text)) => {
                        if let Some(event) = turn.emit_text(&text) {
                            yield event;
                        }
                    }
                    Ok(OpenAiChunk::Complete { .. }) => {}
                    Err(e) => {
                        yield turn.fail(e);
                        return;
                    }
                }
            }
            yield turn.finish();
        })
    }

    fn conversation(&self) -> Conversation {
        self.session.conversation().snapshot()
    }

    fn reset(&self) {
        self.session.reset();
    }
}
