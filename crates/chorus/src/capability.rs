//! Client side of the external tool-execution service.
//!
//! The orchestration layer only needs four operations from it: connect and
//! learn the tool list, call a tool, and disconnect. [`McpStdioClient`]
//! provides them over a child process speaking MCP on stdio.
mod mcp;

pub use mcp::{McpServerConfig, McpStdioClient};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::tool::Tool;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("Failed to start capability server `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("Capability transport error: {0}")]
    Transport(String),

    #[error("Capability server error {code}: {message}")]
    Server { code: i64, message: String },

    #[error("{0}")]
    ToolFailed(String),

    #[error("Not connected to the capability server. Call connect() first.")]
    NotConnected,
}

/// Core trait for the service that executes tools on a model's behalf.
///
/// Implementations must tolerate `call_tool` being invoked concurrently from
/// several adapter tasks sharing one connection.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Establish the session and return the available tools. Calling it again
    /// on a live session returns the cached list.
    async fn connect(&self) -> Result<Vec<Tool>, CapabilityError>;

    /// Tools loaded by the last successful connect, empty before that
    fn tools(&self) -> Vec<Tool>;

    /// Invoke a tool by name with structured arguments
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CapabilityError>;

    /// Tear the session down. Disconnecting twice is not an error.
    async fn disconnect(&self) -> Result<(), CapabilityError>;
}

/// Reduce a raw `tools/call` result to the payload handed to the model.
///
/// Prefers `content`, then `result`, then the whole value. A result flagged
/// with `isError` becomes a [`CapabilityError::ToolFailed`] carrying its text.
pub fn normalize_call_result(raw: Value) -> Result<Value, CapabilityError> {
    if raw.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        let message = raw
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| raw.to_string());
        return Err(CapabilityError::ToolFailed(message));
    }

    let mut raw = raw;
    if let Some(object) = raw.as_object_mut() {
        if let Some(content) = object.remove("content") {
            return Ok(content);
        }
        if let Some(result) = object.remove("result") {
            return Ok(result);
        }
    }
    Ok(raw)
}
