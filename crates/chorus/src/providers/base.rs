use std::fmt::Display;
use std::sync::{Arc, Mutex};

use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use super::factory::BackendKind;
use crate::capability::CapabilityProvider;
use crate::errors::{ChorusError, ToolError, ToolResult};
use crate::models::event::Event;
use crate::models::message::Message;
use crate::models::tool::{Tool, ToolCall};
use crate::session::{Conversation, SharedConversation};

const SUMMARY_LIMIT: usize = 200;

/// Base trait for backend adapters (Anthropic, OpenAI, Ollama)
///
/// An adapter owns one conversation and turns each user message into a
/// sequence of [`Event`]s, running the tool-use bridge when the model asks for
/// a tool. Every sequence ends with exactly one `End` or `Error`.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start a turn. Nothing happens until the returned stream is polled;
    /// dropping it part way cancels the turn and keeps any partial text.
    fn initiate_turn(self: Arc<Self>, user_message: String) -> BoxStream<'static, Event>;

    /// Snapshot of the conversation so far
    fn conversation(&self) -> Conversation;

    /// Forget the conversation and the cached tool list
    fn reset(&self);
}

/// Tools as loaded from the capability provider plus an adapter's own wire form of them
#[derive(Debug)]
pub struct LoadedTools<W> {
    pub tools: Vec<Tool>,
    pub wire: W,
}

/// State every adapter carries: its conversation, the gate that keeps one
/// turn at a time on it, and its view of the capability provider.
pub struct AdapterSession<W> {
    kind: BackendKind,
    conversation: SharedConversation,
    turn_gate: Arc<Semaphore>,
    capability: Option<Arc<dyn CapabilityProvider>>,
    tools: Mutex<Option<Arc<LoadedTools<W>>>>,
}

impl<W> AdapterSession<W> {
    pub fn new<S: Into<String>>(
        kind: BackendKind,
        system_prompt: S,
        capability: Option<Arc<dyn CapabilityProvider>>,
    ) -> Self {
        Self {
            kind,
            conversation: SharedConversation::new(Conversation::new(system_prompt)),
            turn_gate: Arc::new(Semaphore::new(1)),
            capability,
            tools: Mutex::new(None),
        }
    }

    pub fn capability(&self) -> Option<Arc<dyn CapabilityProvider>> {
        self.capability.clone()
    }

    pub fn conversation(&self) -> &SharedConversation {
        &self.conversation
    }

    /// Wait for any running turn on this adapter to finish, then open a new one
    pub async fn begin_turn(&self, user_message: &str) -> Result<Turn, ChorusError> {
        let permit = self
            .turn_gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| ChorusError::Internal(format!("turn gate closed: {}", e)))?;

        info!("{} turn started", self.kind);
        self.conversation.push(Message::user().with_text(user_message));
        Ok(Turn {
            kind: self.kind,
            conversation: self.conversation.clone(),
            transcript: String::new(),
            settled: false,
            _permit: permit,
        })
    }

    /// Tools for this adapter, connecting on first use and caching the wire
    /// form until the next reset. No capability provider means no tools.
    pub async fn tools<F>(&self, convert: F) -> anyhow::Result<Arc<LoadedTools<W>>>
    where
        F: FnOnce(&[Tool]) -> anyhow::Result<W>,
    {
        if let Some(loaded) = self.cached_tools() {
            return Ok(loaded);
        }

        let tools = match &self.capability {
            Some(capability) => capability.connect().await?,
            None => Vec::new(),
        };
        let wire = convert(&tools)?;
        debug!("{} loaded {} tools", self.kind, tools.len());

        let loaded = Arc::new(LoadedTools { tools, wire });
        *self.tools.lock().unwrap_or_else(|p| p.into_inner()) = Some(loaded.clone());
        Ok(loaded)
    }

    fn cached_tools(&self) -> Option<Arc<LoadedTools<W>>> {
        self.tools
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn reset(&self) {
        info!("{} session reset", self.kind);
        self.conversation.clear();
        self.tools.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

/// Bookkeeping for one turn against a conversation.
///
/// Collects the text the model has produced, writes the tool exchange and the
/// final (or error) assistant message, and on drop without either keeps the
/// partial text so a cancelled turn still shows up in history.
pub struct Turn {
    kind: BackendKind,
    conversation: SharedConversation,
    transcript: String,
    settled: bool,
    _permit: OwnedSemaphorePermit,
}

impl Turn {
    /// Record model text and produce the event for it, if there is any text
    pub fn emit_text(&mut self, text: &str) -> Option<Event> {
        if text.is_empty() {
            return None;
        }
        self.transcript.push_str(text);
        Some(Event::text(text))
    }

    /// Record model text that is not shown to the caller
    pub fn absorb(&mut self, text: &str) {
        self.transcript.push_str(text);
    }

    /// Text recorded since the last tool exchange
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Append the assistant's tool-call message and then the tool results, as
    /// one uninterrupted pair. Text so far belongs to the tool-call message.
    pub fn record_tool_exchange(&mut self, exchange: Vec<(ToolCall, ToolResult<Value>)>) {
        let mut request = Message::assistant();
        if !self.transcript.is_empty() {
            request = request.with_text(std::mem::take(&mut self.transcript));
        }
        let mut response = Message::tool();
        for (call, result) in exchange {
            response = response.with_tool_response(call.id.clone(), call.name.clone(), result);
            request = request.with_tool_request(call.id.clone(), call);
        }
        self.conversation.extend([request, response]);
    }

    pub fn finish(mut self) -> Event {
        self.settled = true;
        let text = std::mem::take(&mut self.transcript);
        self.conversation.push(Message::assistant().with_text(text));
        info!("{} turn finished", self.kind);
        Event::End
    }

    pub fn fail<E: Display>(mut self, error: E) -> Event {
        self.settled = true;
        let message = error.to_string();
        warn!("{} turn failed: {}", self.kind, message);

        let mut reply = Message::assistant();
        if !self.transcript.is_empty() {
            reply = reply.with_text(std::mem::take(&mut self.transcript));
        }
        self.conversation
            .push(reply.with_text(format!("Error: {}", message)));
        Event::error(message)
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        info!("{} turn cancelled", self.kind);
        if !self.transcript.is_empty() {
            let partial = std::mem::take(&mut self.transcript);
            self.conversation.push(Message::assistant().with_text(partial));
        }
    }
}

/// Invoke a tool, turning every failure into a result the model can read
pub async fn run_tool(capability: Option<&dyn CapabilityProvider>, call: &ToolCall) -> ToolResult<Value> {
    let capability = capability.ok_or_else(|| {
        ToolError::ExecutionError("no capability provider is configured".to_string())
    })?;

    info!("Calling tool {} with {}", call.name, call.arguments);
    capability
        .call_tool(&call.name, call.arguments.clone())
        .await
        .map_err(|e| {
            warn!("Tool {} failed: {}", call.name, e);
            ToolError::ExecutionError(e.to_string())
        })
}

/// Short printable form of a tool result for the ToolResult event
pub fn summarize_tool_result(result: &ToolResult<Value>) -> String {
    let full = match result {
        Ok(Value::String(text)) => text.clone(),
        Ok(value) => value.to_string(),
        Err(e) => e.to_string(),
    };
    if full.chars().count() <= SUMMARY_LIMIT {
        return full;
    }
    let mut summary: String = full.chars().take(SUMMARY_LIMIT).collect();
    summary.push_str("...");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::role::Role;
    use crate::providers::mock::MockCapabilityProvider;
    use serde_json::json;

    fn session() -> AdapterSession<Vec<String>> {
        AdapterSession::new(
            BackendKind::Ollama,
            "system",
            Some(Arc::new(MockCapabilityProvider::new()) as Arc<dyn CapabilityProvider>),
        )
    }

    #[tokio::test]
    async fn test_turn_records_exchange_then_final_text() -> anyhow::Result<()> {
        let session = session();
        let mut turn = session.begin_turn("hi").await?;

        assert_eq!(turn.emit_text("Let me check. "), Some(Event::text("Let me check. ")));
        assert_eq!(turn.emit_text(""), None);
        let call = ToolCall::new("1", "echo", json!({"message": "x"}));
        turn.record_tool_exchange(vec![(call, Ok(json!("x")))]);
        turn.emit_text("Done.");
        assert_eq!(turn.finish(), Event::End);

        let conversation = session.conversation().snapshot();
        let roles: Vec<Role> = conversation.history().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(conversation.history()[1].text(), "Let me check. ");
        assert_eq!(conversation.history()[1].tool_requests().count(), 1);
        assert_eq!(conversation.history()[3].text(), "Done.");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_error_in_history() -> anyhow::Result<()> {
        let session = session();
        let mut turn = session.begin_turn("hi").await?;
        turn.emit_text("partial ");
        let event = turn.fail("connection reset");

        assert_eq!(event, Event::error("connection reset"));
        let last = session.conversation().snapshot().last().cloned().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text(), "partial Error: connection reset");
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_turn_keeps_partial_text() -> anyhow::Result<()> {
        let session = session();
        {
            let mut turn = session.begin_turn("hi").await?;
            turn.emit_text("half an ans");
        }
        let conversation = session.conversation().snapshot();
        assert_eq!(conversation.history().len(), 2);
        assert_eq!(conversation.history()[1].text(), "half an ans");

        // The gate was released with the dropped turn
        let turn = session.begin_turn("again").await?;
        turn.finish();
        Ok(())
    }

    #[tokio::test]
    async fn test_turns_are_serialized() -> anyhow::Result<()> {
        let session = Arc::new(session());
        let first = session.begin_turn("one").await?;

        let waiting = {
            let session = session.clone();
            tokio::spawn(async move { session.begin_turn("two").await.map(|t| t.finish()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        // The second user message is not appended while the first turn runs
        assert_eq!(session.conversation().snapshot().history().len(), 1);

        first.finish();
        assert_eq!(waiting.await??, Event::End);
        Ok(())
    }

    #[tokio::test]
    async fn test_tools_are_cached_until_reset() -> anyhow::Result<()> {
        let capability = Arc::new(MockCapabilityProvider::new());
        let session: AdapterSession<Vec<String>> = AdapterSession::new(
            BackendKind::OpenAi,
            "system",
            Some(capability.clone() as Arc<dyn CapabilityProvider>),
        );

        let names = |tools: &[Tool]| -> anyhow::Result<Vec<String>> {
            Ok(tools.iter().map(|t| t.name.clone()).collect())
        };
        let first = session.tools(names).await?;
        assert_eq!(first.wire, vec!["echo".to_string()]);
        session.tools(names).await?;
        assert_eq!(capability.connect_count(), 1);

        session.reset();
        session.tools(names).await?;
        assert_eq!(capability.connect_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_tool() {
        let capability = MockCapabilityProvider::new();
        let ok = run_tool(Some(&capability), &ToolCall::new("1", "echo", json!({"message": "hi"}))).await;
        assert_eq!(ok, Ok(json!({"echo": {"message": "hi"}})));

        let missing = run_tool(None, &ToolCall::new("2", "echo", json!({}))).await;
        assert!(matches!(missing, Err(ToolError::ExecutionError(_))));

        let failing = MockCapabilityProvider::failing("quota exceeded");
        let err = run_tool(Some(&failing), &ToolCall::new("3", "echo", json!({}))).await;
        assert!(err.unwrap_err().to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_summarize_tool_result() {
        assert_eq!(summarize_tool_result(&Ok(json!("short"))), "short");
        assert_eq!(summarize_tool_result(&Ok(json!({"a": 1}))), r#"{"a":1}"#);
        let long = "x".repeat(500);
        let summary = summarize_tool_result(&Ok(json!(long)));
        assert_eq!(summary.chars().count(), SUMMARY_LIMIT + 3);
        assert!(summary.ends_with("..."));
    }
}
