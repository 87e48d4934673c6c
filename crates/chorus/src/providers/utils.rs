use std::collections::HashSet;
use std::fmt::Display;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::errors::ProviderError;
use crate::models::message::{Message, MessageContent};
use crate::models::role::Role;
use crate::models::tool::{Tool, ToolCall};

lazy_static! {
    static ref VALID_FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
    static ref INVALID_FUNCTION_CHARS: Regex = Regex::new(r"[^a-zA-Z0-9_-]").unwrap();
}

/// Convert internal Message format to OpenAI's chat message specification.
/// The system prompt always goes first; system messages inside the history are skipped.
pub fn messages_to_openai_spec(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut messages_spec = vec![json!({"role": "system", "content": system})];

    for message in messages {
        if message.role == Role::System {
            continue;
        }

        if message.role == Role::Tool {
            for response in message.tool_responses() {
                messages_spec.push(json!({
                    "role": "tool",
                    "content": response.as_text(),
                    "tool_call_id": response.id
                }));
            }
            continue;
        }

        let mut converted = json!({"role": message.role});
        let text = message.text();
        if !text.is_empty() {
            converted["content"] = json!(text);
        }

        let tool_calls: Vec<Value> = message
            .tool_requests()
            .map(|request| {
                json!({
                    "id": request.id,
                    "type": "function",
                    "function": {
                        "name": sanitize_function_name(&request.tool_call.name),
                        "arguments": request.tool_call.arguments.to_string(),
                    }
                })
            })
            .collect();
        if !tool_calls.is_empty() {
            converted["tool_calls"] = json!(tool_calls);
        }

        if converted.get("content").is_some() || converted.get("tool_calls").is_some() {
            messages_spec.push(converted);
        }
    }

    messages_spec
}

/// Convert internal Message format to Anthropic's messages specification.
///
/// Consecutive messages with the same role are merged, tool results travel in
/// a user message, and empty text blocks are dropped since the API rejects them.
pub fn messages_to_anthropic_spec(messages: &[Message]) -> Vec<Value> {
    let mut spec: Vec<Value> = Vec::new();

    for message in messages {
        let role = match message.role {
            Role::System => continue,
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };

        let mut blocks = Vec::new();
        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.trim().is_empty() {
                        blocks.push(json!({"type": "text", "text": text.text}));
                    }
                }
                MessageContent::ToolRequest(request) => blocks.push(json!({
                    "type": "tool_use",
                    "id": request.id,
                    "name": request.tool_call.name,
                    "input": request.tool_call.arguments,
                })),
                MessageContent::ToolResponse(response) => blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": response.id,
                    "content": response.as_text(),
                    "is_error": response.tool_result.is_err(),
                })),
            }
        }
        if blocks.is_empty() {
            continue;
        }

        match spec.last_mut() {
            Some(previous) if previous["role"] == role => {
                if let Some(existing) = previous["content"].as_array_mut() {
                    existing.extend(blocks);
                }
            }
            _ => spec.push(json!({"role": role, "content": blocks})),
        }
    }

    spec
}

/// Render history as the plain-text transcript a raw completion endpoint expects
pub fn messages_to_prompt(system: &str, messages: &[Message]) -> String {
    let mut prompt = format!("System: {}\n\n", system);

    for message in messages {
        match message.role {
            Role::System => continue,
            Role::Tool => {
                for response in message.tool_responses() {
                    prompt.push_str(&format!(
                        "[Tool Results from {}]: {}\n",
                        response.name,
                        response.as_text()
                    ));
                }
            }
            role => {
                prompt.push_str(&format!("{}: {}\n", role.prompt_label(), message.text()));
            }
        }
    }

    prompt
}

/// Convert internal Tool format to Anthropic's tool specification
pub fn tools_to_anthropic_spec(tools: &[Tool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect()
}

/// Convert internal Tool format to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> Result<Vec<Value>> {
    let mut tool_names = HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !tool_names.insert(&tool.name) {
            return Err(anyhow!("Duplicate tool name: {}", tool.name));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": prepare_openai_parameters(&tool.input_schema),
            }
        }));
    }

    Ok(result)
}

/// Tighten an input schema into the shape OpenAI's function calling accepts:
/// a closed object whose properties all have a type, every property required
/// unless the schema says otherwise.
pub fn prepare_openai_parameters(input_schema: &Value) -> Value {
    let mut schema = match input_schema {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    schema.insert("additionalProperties".to_string(), json!(false));
    schema.insert("type".to_string(), json!("object"));

    let properties = schema
        .entry("properties")
        .or_insert_with(|| json!({}));
    if let Some(properties) = properties.as_object_mut() {
        for (name, property) in properties.iter_mut() {
            if let Some(property) = property.as_object_mut() {
                property
                    .entry("type")
                    .or_insert_with(|| json!("string"));
                if name == "query" {
                    property
                        .entry("description")
                        .or_insert_with(|| json!("The search query to execute"));
                }
            }
        }
    }

    if !schema.contains_key("required") {
        let required: Vec<String> = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default();
        schema.insert("required".to_string(), json!(required));
    }

    Value::Object(schema)
}

pub fn sanitize_function_name(name: &str) -> String {
    INVALID_FUNCTION_CHARS.replace_all(name, "_").to_string()
}

pub fn is_valid_function_name(name: &str) -> bool {
    VALID_FUNCTION_NAME.is_match(name)
}

/// Parse tool arguments produced by a model. Empty input means no arguments;
/// text that is not valid JSON is passed through as a single `query` field.
pub fn parse_tool_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Could not parse tool arguments ({}), passing raw text as query", e);
            json!({"query": raw})
        }
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    index: u32,
    id: String,
    name: String,
    arguments: String,
}

/// Reassembles tool calls streamed as fragments keyed by position.
///
/// The first fragment carrying an id or name sets it; argument fragments are
/// appended in arrival order. Nothing is parsed until [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    pending: Vec<PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let position = match self.pending.iter().position(|p| p.index == index) {
            Some(position) => position,
            None => {
                self.pending.push(PendingToolCall {
                    index,
                    ..Default::default()
                });
                self.pending.len() - 1
            }
        };
        let call = &mut self.pending[position];

        if let Some(id) = id.filter(|id| !id.is_empty()) {
            if call.id.is_empty() {
                call.id = id.to_string();
            }
        }
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            if call.name.is_empty() {
                call.name = name.to_string();
            }
        }
        if let Some(arguments) = arguments {
            call.arguments.push_str(arguments);
        }
    }

    /// Completed calls in index order with their arguments parsed
    pub fn finish(self) -> Vec<ToolCall> {
        let mut pending = self.pending;
        pending.sort_by_key(|p| p.index);
        pending
            .into_iter()
            .map(|p| {
                let id = if p.id.is_empty() {
                    format!("call_{}", Uuid::new_v4().simple())
                } else {
                    p.id
                };
                let arguments = parse_tool_arguments(&p.arguments);
                ToolCall::new(id, p.name, arguments)
            })
            .collect()
    }
}

/// Result of looking for a JSON object in streamed text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonObjectScan {
    /// No opening brace yet
    NotStarted,
    /// An object has started but its closing brace has not arrived
    Incomplete,
    /// Byte range of the first balanced object
    Complete { start: usize, end: usize },
}

/// Find the first balanced `{...}` in `text`, ignoring braces inside strings
pub fn scan_json_object(text: &str) -> JsonObjectScan {
    let start = match text.find('{') {
        Some(start) => start,
        None => return JsonObjectScan::NotStarted,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return JsonObjectScan::Complete {
                        start,
                        end: start + offset + 1,
                    };
                }
            }
            _ => {}
        }
    }
    JsonObjectScan::Incomplete
}

fn drain_until(buffer: &mut Vec<u8>, delimiter: &[u8]) -> Option<String> {
    let position = buffer
        .windows(delimiter.len())
        .position(|window| window == delimiter)?;
    let block: Vec<u8> = buffer.drain(..position + delimiter.len()).collect();
    Some(String::from_utf8_lossy(&block[..position]).into_owned())
}

fn sse_data(block: &str) -> Option<String> {
    let data: Vec<&str> = block
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if data.is_empty() {
        None
    } else {
        Some(data.join("\n"))
    }
}

/// Split a server-sent-events body into the `data` payload of each event.
///
/// Bytes are buffered until a blank line closes the event, so multi-byte
/// characters split across network reads are decoded intact. Comment and
/// keep-alive events are skipped.
pub fn sse_data_stream<S, E>(body: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream::unfold(
        (Box::pin(body), Vec::<u8>::new(), false),
        |(mut body, mut buffer, mut finished)| async move {
            loop {
                if let Some(block) = drain_until(&mut buffer, b"\n\n") {
                    match sse_data(&block) {
                        Some(data) => return Some((Ok(data), (body, buffer, finished))),
                        None => continue,
                    }
                }
                if finished {
                    let rest = String::from_utf8_lossy(&buffer).into_owned();
                    buffer.clear();
                    return sse_data(rest.trim()).map(|data| (Ok(data), (body, buffer, finished)));
                }
                match body.next().await {
                    Some(Ok(bytes)) => buffer.extend(bytes.iter().filter(|b| **b != b'\r')),
                    Some(Err(e)) => {
                        finished = true;
                        buffer.clear();
                        return Some((
                            Err(ProviderError::Stream(format!("stream read error: {}", e))),
                            (body, buffer, finished),
                        ));
                    }
                    None => finished = true,
                }
            }
        },
    )
}

/// Split a newline-delimited JSON body into its non-empty lines
pub fn ndjson_line_stream<S, E>(body: S) -> impl Stream<Item = Result<String, ProviderError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    stream::unfold(
        (Box::pin(body), Vec::<u8>::new(), false),
        |(mut body, mut buffer, mut finished)| async move {
            loop {
                if let Some(line) = drain_until(&mut buffer, b"\n") {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line.to_string()), (body, buffer, finished)));
                }
                if finished {
                    let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                    buffer.clear();
                    if rest.is_empty() {
                        return None;
                    }
                    return Some((Ok(rest), (body, buffer, finished)));
                }
                match body.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        finished = true;
                        buffer.clear();
                        return Some((
                            Err(ProviderError::Stream(format!("stream read error: {}", e))),
                            (body, buffer, finished),
                        ));
                    }
                    None => finished = true,
                }
            }
        },
    )
}

/// Read an error response body and classify it by status
pub async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(status, body)
}
