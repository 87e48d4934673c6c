use serde::{Deserialize, Serialize};

/// The normalized unit of streamed output produced by every provider adapter.
///
/// Events carry no backend identity; the multiplexer attaches the source label
/// when it wraps them into an [`OutputEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TextDelta { text: String },
    ToolInvoked { name: String },
    ToolResult { name: String, summary: String },
    Error { message: String },
    End,
}

impl Event {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Event::TextDelta { text: text.into() }
    }

    pub fn tool_invoked<S: Into<String>>(name: S) -> Self {
        Event::ToolInvoked { name: name.into() }
    }

    pub fn tool_result<N: Into<String>, S: Into<String>>(name: N, summary: S) -> Self {
        Event::ToolResult {
            name: name.into(),
            summary: summary.into(),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Event::Error {
            message: message.into(),
        }
    }

    /// Exactly one of Error or End closes a source's sequence
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Error { .. } | Event::End)
    }

    /// Short tag used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TextDelta { .. } => "text",
            Event::ToolInvoked { .. } => "tool_invoked",
            Event::ToolResult { .. } => "tool_result",
            Event::Error { .. } => "error",
            Event::End => "end",
        }
    }

    /// Text shown to a reader of the merged stream
    pub fn render(&self) -> Option<String> {
        match self {
            Event::TextDelta { text } => Some(text.clone()),
            Event::ToolInvoked { name } => Some(format!("\n[Using tool: {}]\n", name)),
            Event::ToolResult { name, .. } => Some(format!("\n[Tool results from {}]\n", name)),
            Event::Error { message } => Some(format!("Error: {}", message)),
            Event::End => None,
        }
    }
}

/// An event tagged with the label of the backend that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEnvelope {
    pub source: String,
    pub payload: Event,
}

impl OutputEnvelope {
    pub fn new<S: Into<String>>(source: S, payload: Event) -> Self {
        Self {
            source: source.into(),
            payload,
        }
    }
}
