use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_stream::{stream, try_stream};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::base::{run_tool, summarize_tool_result, AdapterSession, ProviderAdapter};
use super::configs::OllamaProviderConfig;
use super::factory::BackendKind;
use super::utils::{
    error_from_response, is_valid_function_name, messages_to_prompt, ndjson_line_stream,
    parse_tool_arguments, scan_json_object, JsonObjectScan,
};
use crate::capability::CapabilityProvider;
use crate::errors::{ProviderError, ToolError, ToolResult};
use crate::models::event::Event;
use crate::models::tool::ToolCall;
use crate::prompt_template::local_tools_prompt;
use crate::session::Conversation;

pub const TOOL_MARKER: &str = "I need to use ";
pub const TOOL_PARAMETERS: &str = " with these parameters:";

/// Output of [`ToolPatternScanner::push`]
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutput {
    /// Text that can no longer be part of a tool request
    Text(String),
    /// A complete tool request; `raw` is the request text as the model wrote it
    ToolCall { call: ToolCall, raw: String },
}

/// Watches a raw completion for `I need to use <TOOL> with these parameters: <json>`.
///
/// Text that cannot start the marker is released in chunks once more than
/// `hold_threshold` characters are waiting; anything that might still become
/// the marker is held back. Fires at most once.
#[derive(Debug)]
pub struct ToolPatternScanner {
    buffer: String,
    hold_threshold: usize,
    release_chunk: usize,
    enabled: bool,
    triggered: bool,
}

impl ToolPatternScanner {
    pub fn new(hold_threshold: usize, release_chunk: usize) -> Self {
        Self {
            buffer: String::new(),
            hold_threshold,
            release_chunk: release_chunk.max(1),
            enabled: true,
            triggered: false,
        }
    }

    /// A scanner that never detects anything and never holds text back
    pub fn passthrough() -> Self {
        Self {
            enabled: false,
            ..Self::new(0, 1)
        }
    }

    pub fn push(&mut self, piece: &str) -> Vec<ScanOutput> {
        if !self.enabled || self.triggered {
            if piece.is_empty() {
                return Vec::new();
            }
            return vec![ScanOutput::Text(piece.to_string())];
        }

        self.buffer.push_str(piece);
        let mut output = Vec::new();

        while let Some(start) = self.buffer.find(TOOL_MARKER) {
            if start > 0 {
                output.push(ScanOutput::Text(self.buffer.drain(..start).collect()));
            }
            if !self.marker_is_stale() {
                if let Some(detected) = self.extract() {
                    self.triggered = true;
                    output.push(detected);
                }
                return output;
            }
            // Ordinary prose; let the marker go and keep scanning what follows
            output.push(ScanOutput::Text(self.buffer.drain(..TOOL_MARKER.len()).collect()));
        }

        while self.buffer.chars().count() > self.hold_threshold {
            let chunk_end = self
                .buffer
                .char_indices()
                .nth(self.release_chunk)
                .map(|(i, _)| i)
                .unwrap_or(self.buffer.len());
            let end = chunk_end.min(self.releasable_len());
            if end == 0 {
                break;
            }
            output.push(ScanOutput::Text(self.buffer.drain(..end).collect()));
        }
        output
    }

    /// Whatever is still held once the completion is over
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }

    /// Bytes at the front of the buffer that cannot be the start of the marker
    fn releasable_len(&self) -> usize {
        let len = self.buffer.len();
        self.buffer
            .char_indices()
            .map(|(i, _)| i)
            .filter(|i| len - i < TOOL_MARKER.len())
            .find(|i| TOOL_MARKER.starts_with(&self.buffer[*i..]))
            .unwrap_or(len)
    }

    /// The buffer starts with the marker but the request shape has not shown up
    /// in time: another marker comes before the separator, no separator within
    /// `hold_threshold` characters of the tool name, or no `{` within
    /// `hold_threshold` characters of the separator.
    fn marker_is_stale(&self) -> bool {
        let after = &self.buffer[TOOL_MARKER.len()..];
        let separator = after.find(TOOL_PARAMETERS);
        if let Some(next) = after.find(TOOL_MARKER) {
            if separator.map_or(true, |separator| next < separator) {
                return true;
            }
        }
        match separator {
            None => after.chars().count() > TOOL_PARAMETERS.len() + self.hold_threshold,
            Some(separator) => {
                let parameters = &after[separator + TOOL_PARAMETERS.len()..];
                matches!(scan_json_object(parameters), JsonObjectScan::NotStarted)
                    && parameters.chars().count() > self.hold_threshold
            }
        }
    }

    /// The buffer starts with the marker; try to read a full request off it
    fn extract(&mut self) -> Option<ScanOutput> {
        let after = &self.buffer[TOOL_MARKER.len()..];
        let separator = after.find(TOOL_PARAMETERS)?;
        let name = after[..separator].trim().to_string();
        let parameters = &after[separator + TOOL_PARAMETERS.len()..];

        let (start, end) = match scan_json_object(parameters) {
            JsonObjectScan::Complete { start, end } => (start, end),
            JsonObjectScan::NotStarted | JsonObjectScan::Incomplete => return None,
        };
        let arguments = parse_tool_arguments(&parameters[start..end]);

        let raw_end = TOOL_MARKER.len() + separator + TOOL_PARAMETERS.len() + end;
        let raw: String = self.buffer.drain(..raw_end).collect();
        info!("Detected tool call to {} with params {}", name, arguments);

        let call = ToolCall::new(format!("call_{}", Uuid::new_v4().simple()), name, arguments);
        Some(ScanOutput::ToolCall { call, raw })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

fn ollama_chunks<S>(lines: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<String, ProviderError>> + Send + 'static,
{
    try_stream! {
        futures::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            let line = line?;
            let chunk: GenerateChunk = match serde_json::from_str(&line) {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Skipping undecodable Ollama line ({}): {}", e, line);
                    continue;
                }
            };
            if let Some(error) = chunk.error {
                Err::<(), _>(ProviderError::Stream(error))?;
            }
            if !chunk.response.is_empty() {
                yield chunk.response;
            }
            if chunk.done {
                break;
            }
        }
    }
}

fn tool_result_text(result: &ToolResult<Value>) -> String {
    match result {
        Ok(value) => value.to_string(),
        Err(e) => json!(e.to_string()).to_string(),
    }
}

/// Adapter for a local Ollama `/api/generate` endpoint, which has no tool API.
///
/// Tools are described in the system prompt and requested by the model in
/// plain text; the continuation after a tool runs is a fresh completion over
/// the whole prompt with the result inlined.
pub struct OllamaAdapter {
    client: Client,
    config: OllamaProviderConfig,
    session: AdapterSession<String>,
}

impl OllamaAdapter {
    pub fn new(
        config: OllamaProviderConfig,
        system_prompt: &str,
        capability: Option<Arc<dyn CapabilityProvider>>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self {
            client,
            config,
            session: AdapterSession::new(BackendKind::Ollama, system_prompt, capability),
        })
    }

    async fn generate(
        &self,
        prompt: &str,
    ) -> Result<impl Stream<Item = Result<String, ProviderError>> + Send, ProviderError> {
        let url = format!("{}/api/generate", self.config.host.trim_end_matches('/'));
        let payload = json!({
            "model": self.config.model,
            "prompt": prompt,
            "stream": true,
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        Ok(ollama_chunks(ndjson_line_stream(response.bytes_stream())))
    }

    fn scanner(&self, has_tools: bool) -> ToolPatternScanner {
        if has_tools {
            ToolPatternScanner::new(self.config.hold_threshold, self.config.release_chunk)
        } else {
            ToolPatternScanner::passthrough()
        }
    }
}

impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Ollama
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

            let base_prompt = self.session.conversation().snapshot().system_prompt().to_string();
            let template = self.config.tool_prompt.clone();
            let tools = match self
                .session
                .tools(move |tools| {
                    if tools.is_empty() {
                        return Ok(base_prompt);
                    }
                    Ok(local_tools_prompt(&base_prompt, tools, template.as_ref())?)
                })
                .await
            {
                Ok(tools) => tools,
                Err(e) => {
                    yield turn.fail(format!("Failed to load tools: {}", e));
                    return;
                }
            };

            let conversation = self.session.conversation().snapshot();
            let prompt = format!("{}Assistant:", messages_to_prompt(&tools.wire, conversation.history()));
            let pieces = match self.generate(&prompt).await {
                Ok(pieces) => pieces,
                Err(e) => {
                    yield turn.fail(e);
                    return;
                }
            };
            futures::pin_mut!(pieces);

            let mut scanner = self.scanner(!tools.tools.is_empty());
            let mut detected = None;
            while let Some(piece) = pieces.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(e) => {
                        yield turn.fail(e);
                        return;
                    }
                };
                for output in scanner.push(&piece) {
                    match output {
                        ScanOutput::Text(text) => {
                            if let Some(event) = turn.emit_text(&text) {
                                yield event;
                            }
                        }
                        ScanOutput::ToolCall { call, raw } => {
                            turn.absorb(&raw);
                            detected = Some(call);
                        }
                    }
                }
                // Whatever the model writes after the request is discarded
                if detected.is_some() {
                    break;
                }
            }

            let call = match detected {
                Some(call) => call,
                None => {
                    if let Some(rest) = scanner.finish() {
                        if let Some(event) = turn.emit_text(&rest) {
                            yield event;
                        }
                    }
                    yield turn.finish();
                    return;
                }
            };

            let generated = turn.transcript().to_string();
            yield Event::tool_invoked(&call.name);
            let result = if is_valid_function_name(&call.name) {
                let capability = self.session.capability();
                run_tool(capability.as_deref(), &call).await
            } else {
                Err(ToolError::ToolNotFound(format!("No tool named '{}'", call.name)))
            };
            yield Event::tool_result(&call.name, summarize_tool_result(&result));

            let follow_up = format!(
                "{}{}\n\n[Tool Results from {}]: {}\n\nAssistant:",
                prompt,
                generated,
                call.name,
                tool_result_text(&result)
            );
            turn.record_tool_exchange(vec![(call, result)]);

            let pieces = match self.generate(&follow_up).await {
                Ok(pieces) => pieces,
                Err(e) => {
                    yield turn.fail(e);
                    return;
                }
            };
            futures::pin_mut!(pieces);

            while let Some(piece) = pieces.next().await {
                match piece {
                    Ok(piece) => {
                        if let Some(event) = turn.emit_text(&piece) {
                            yield event;
                        }
                    }
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
