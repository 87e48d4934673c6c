use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::{stream, try_stream};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::base::{run_tool, summarize_tool_result, AdapterSession, ProviderAdapter};
use super::configs::AnthropicProviderConfig;
use super::factory::BackendKind;
use super::utils::{
    error_from_response, messages_to_anthropic_spec, sse_data_stream, tools_to_anthropic_spec,
    ToolCallAccumulator,
};
use crate::capability::CapabilityProvider;
use crate::errors::ProviderError;
use crate::models::event::Event;
use crate::models::message::Message;
use crate::models::tool::ToolCall;
use crate::session::Conversation;

pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: i32 = 1000;

/// System prompt for the request that follows a tool exchange
pub const CONTINUATION_PROMPT: &str = "You are a helpful assistant analyse the messages and tool results and provide an appropriate response to the user.";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
    },
    MessageStop,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// What the adapter needs out of one streamed message
#[derive(Debug, PartialEq)]
enum AnthropicChunk {
    Text(String),
    /// Sent once, when the message is over; tool uses are complete by then
    Complete {
        stop_reason: Option<String>,
        tool_uses: Vec<ToolCall>,
    },
}

fn anthropic_chunks<S>(events: S) -> impl Stream<Item = Result<AnthropicChunk, ProviderError>> + Send
where
    S: Stream<Item = Result<String, ProviderError>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(events);
        let mut tool_uses = ToolCallAccumulator::new();
        let mut stop_reason = None;

        while let Some(data) = events.next().await {
            let data = data?;
            let event: StreamEvent = match serde_json::from_str(&data) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping undecodable Anthropic event ({}): {}", e, data);
                    continue;
                }
            };

            match event {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::ToolUse { id, name },
                } => tool_uses.push(index, Some(&id), Some(&name), None),
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::TextDelta { text },
                    ..
                } => {
                    yield AnthropicChunk::Text(text);
                }
                StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::InputJsonDelta { partial_json },
                } => tool_uses.push(index, None, None, Some(&partial_json)),
                StreamEvent::MessageDelta { delta } => {
                    if delta.stop_reason.is_some() {
                        stop_reason = delta.stop_reason;
                    }
                }
                StreamEvent::MessageStop => break,
                StreamEvent::Error { error } => Err::<(), _>(ProviderError::Stream(error.message))?,
                _ => {}
            }
        }

        yield AnthropicChunk::Complete {
            stop_reason,
            tool_uses: tool_uses.finish(),
        };
    }
}

/// Adapter for Anthropic's streaming Messages API, which reports complete
/// tool-use blocks by the time the message stops.
pub struct AnthropicAdapter {
    client: Client,
    config: AnthropicProviderConfig,
    session: AdapterSession<Vec<Value>>,
}

impl AnthropicAdapter {
    pub fn new(
        config: AnthropicProviderConfig,
        system_prompt: &str,
        capability: Option<Arc<dyn CapabilityProvider>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self {
            client,
            config,
            session: AdapterSession::new(BackendKind::Anthropic, system_prompt, capability),
        })
    }

    fn payload(&self, system: &str, messages: &[Message], tools: &[Value]) -> Value {
        let mut payload = json!({
            "model": self.config.model,
            "system": system,
            "messages": messages_to_anthropic_spec(messages),
            "max_tokens": self.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": true,
        });
        if !tools.is_empty() {
            payload["tools"] = json!(tools);
        }
        if let Some(temperature) = self.config.temperature {
            payload["temperature"] = json!(temperature);
        }
        payload
    }

    async fn stream(
        &self,
        payload: Value,
    ) -> Result<impl Stream<Item = Result<AnthropicChunk, ProviderError>> + Send, ProviderError> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(anthropic_chunks(sse_data_stream(response.bytes_stream())))
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
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
            let tools = match self
                .session
                .tools(|tools| Ok(tools_to_anthropic_spec(tools)))
                .await
            {
                Ok(tools) => tools,
                Err(e) => {
                    yield turn.fail(format!("Failed to load tools: {}", e));
                    return;
                }
            };

            let conversation = self.session.conversation().snapshot();
            let payload = self.payload(conversation.system_prompt(), conversation.history(), &tools.wire);
            let chunks = match self.stream(payload).await {
                Ok(chunks) => chunks,
                Err(e) => {
                    yield turn.fail(e);
                    return;
                }
            };
            futures::pin_mut!(chunks);

            let mut stop_reason = None;
            let mut tool_uses = Vec::new();
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(AnthropicChunk::Text(text)) => {
                        if let Some(event) = turn.emit_text(&text) {
                            yield event;
                        }
                    }
                    Ok(AnthropicChunk::Complete { stop_reason: reason, tool_uses: uses }) => {
                        stop_reason = reason;
                        tool_uses = uses;
                    }
                    Err(e) => {
                        yield turn.fail(e);
                        return;
                    }
                }
            }

            if stop_reason.as_deref() != Some("tool_use") || tool_uses.is_empty() {
                yield turn.finish();
                return;
            }

            info!("Anthropic requested {} tool call(s)", tool_uses.len());
            let capability = self.session.capability();
            let mut exchange = Vec::new();
            for call in tool_uses {
                yield Event::tool_invoked(&call.name);
                let result = run_tool(capability.as_deref(), &call).await;
                yield Event::tool_result(&call.name, summarize_tool_result(&result));
                exchange.push((call, result));
            }
            turn.record_tool_exchange(exchange);

            // One resolve cycle per turn: tool uses in the continuation are not followed
            let conversation = self.session.conversation().snapshot();
            let payload = self.payload(CONTINUATION_PROMPT, conversation.history(), &tools.wire);
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
                    Ok(AnthropicChunk::Text(text)) => {
                        if let Some(event) = turn.emit_text(&text) {
                            yield event;
                        }
                    }
                    Ok(AnthropicChunk::Complete { .. }) => {}
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
