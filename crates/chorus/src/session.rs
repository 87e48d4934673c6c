//! Per-backend conversation history.
//!
//! A [`Conversation`] starts with a fixed system prompt and only ever grows.
//! Adapters share it through [`SharedConversation`], whose lock is held just
//! long enough to read or append and never across an await point.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::message::Message;
use crate::models::role::Role;

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new<S: Into<String>>(system_prompt: S) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            messages: vec![Message::system().with_text(system_prompt.clone())],
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Every message including the leading system message
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Messages after the system prompt, for vendors that take it separately
    pub fn history(&self) -> &[Message] {
        &self.messages[1..]
    }

    pub fn push(&mut self, message: Message) {
        debug_assert!(message.role != Role::System, "system prompt is fixed");
        self.messages.push(message);
    }

    /// Number of messages after the system prompt
    pub fn len(&self) -> usize {
        self.history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.history().last()
    }
}

/// Handle to a conversation owned by one adapter instance
#[derive(Debug, Clone)]
pub struct SharedConversation(Arc<Mutex<Conversation>>);

impl SharedConversation {
    pub fn new(conversation: Conversation) -> Self {
        Self(Arc::new(Mutex::new(conversation)))
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        // A panic mid-append leaves the history itself intact, so keep using it
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, message: Message) {
        self.lock().push(message);
    }

    /// Append several messages without letting another writer interleave
    pub fn extend(&self, messages: impl IntoIterator<Item = Message>) {
        let mut conversation = self.lock();
        for message in messages {
            conversation.push(message);
        }
    }

    pub fn snapshot(&self) -> Conversation {
        self.lock().clone()
    }

    /// Drop everything but the system prompt
    pub fn clear(&self) {
        let mut conversation = self.lock();
        let fresh = Conversation::new(conversation.system_prompt.clone());
        *conversation = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_starts_with_system_prompt() {
        let conversation = Conversation::new("be brief");
        assert_eq!(conversation.len(), 0);
        assert!(conversation.is_empty());
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.messages()[0].role, Role::System);
        assert_eq!(conversation.messages()[0].text(), "be brief");
        assert!(conversation.history().is_empty());
    }

    #[test]
    fn test_shared_conversation_appends_in_order() {
        let shared = SharedConversation::new(Conversation::new("sys"));
        shared.push(Message::user().with_text("one"));
        shared.extend(vec![
            Message::assistant().with_text("two"),
            Message::user().with_text("three"),
        ]);

        let snapshot = shared.snapshot();
        let texts: Vec<String> = snapshot.history().iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert_eq!(snapshot.len(), 3);
        assert!(!snapshot.is_empty());
        assert_eq!(snapshot.last().unwrap().text(), "three");
    }

    #[test]
    fn test_clear_keeps_system_prompt() {
        let shared = SharedConversation::new(Conversation::new("sys"));
        shared.push(Message::user().with_text("hello"));
        shared.clear();

        let snapshot = shared.snapshot();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.messages().len(), 1);
        assert_eq!(snapshot.system_prompt(), "sys");
    }
}
