use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the orchestration layer
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChorusError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend transport failure: {0}")]
    BackendTransport(#[from] ProviderError),

    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    #[error("Malformed tool arguments: {0}")]
    MalformedToolArguments(String),

    #[error("Not connected to the capability provider")]
    NotConnected,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ChorusResult<T> = Result<T, ChorusError>;

/// Classification of a failed exchange with a vendor endpoint
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The endpoint understood the request and refused its shape
    #[error("Request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Unauthorized ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Server error: {0}")]
    Server(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Stream error: {0}")]
    Stream(String),
}

impl ProviderError {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Unauthorized { status, body },
            429 => ProviderError::RateLimited(body),
            s if s >= 500 => ProviderError::Server(s),
            _ => ProviderError::Rejected { status, body },
        }
    }

    /// True when the endpoint refused the request body itself, which is the
    /// failure mode of an unacceptable tool schema
    pub fn is_request_rejection(&self) -> bool {
        matches!(self, ProviderError::Rejected { .. })
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transport(e.to_string())
    }
}

/// Error stored in a tool-result message so the model sees what went wrong
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(400, "bad tools".into()),
            ProviderError::Rejected { status: 400, .. }
        ));
        assert!(matches!(
            ProviderError::from_status(401, String::new()),
            ProviderError::Unauthorized { .. }
        ));
        assert!(matches!(
            ProviderError::from_status(429, String::new()),
            ProviderError::RateLimited(_)
        ));
        assert_eq!(ProviderError::from_status(503, String::new()), ProviderError::Server(503));
    }

    #[test]
    fn test_only_rejections_are_request_rejections() {
        assert!(ProviderError::from_status(422, String::new()).is_request_rejection());
        assert!(!ProviderError::from_status(500, String::new()).is_request_rejection());
        assert!(!ProviderError::Transport("connection reset".into()).is_request_rejection());
    }

    #[test]
    fn test_error_display() {
        let err = ChorusError::from(ProviderError::Server(502));
        assert_eq!(err.to_string(), "Backend transport failure: Server error: 502");
    }
}
