use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::capability::{CapabilityError, CapabilityProvider};
use crate::models::tool::Tool;

enum Behavior {
    Echo,
    Fail(String),
    Hang,
}

/// A mock capability provider exposing one `echo` tool for testing
pub struct MockCapabilityProvider {
    behavior: Behavior,
    connects: AtomicUsize,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockCapabilityProvider {
    /// `echo` answers with `{"echo": <arguments>}`
    pub fn new() -> Self {
        Self::with_behavior(Behavior::Echo)
    }

    /// Every call fails with the given message
    pub fn failing<S: Into<String>>(message: S) -> Self {
        Self::with_behavior(Behavior::Fail(message.into()))
    }

    /// Every call waits forever
    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hang)
    }

    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior,
            connects: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn echo_tool() -> Tool {
        Tool::new(
            "echo",
            "Echo the given message back",
            json!({
                "type": "object",
                "properties": {"message": {"type": "string"}},
                "required": ["message"]
            }),
        )
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every (name, arguments) pair received so far
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CapabilityProvider for MockCapabilityProvider {
    async fn connect(&self) -> Result<Vec<Tool>, CapabilityError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.tools())
    }

    fn tools(&self) -> Vec<Tool> {
        vec![Self::echo_tool()]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, CapabilityError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        match &self.behavior {
            Behavior::Echo => Ok(json!({ "echo": arguments })),
            Behavior::Fail(message) => Err(CapabilityError::ToolFailed(message.clone())),
            Behavior::Hang => futures::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}
