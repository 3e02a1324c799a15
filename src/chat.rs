//! Free-form chat next to page processing.
//!
//! Chat messages go through the same transformer as pages: they are retried
//! on the same policy and charged to the same token quota. The engine keeps
//! the most recent [`MAX_CHAT_HISTORY`] turns in memory and can save them
//! through its result sink.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Turns kept in memory; user and assistant messages each count as one.
pub const MAX_CHAT_HISTORY: usize = 20;

/// Reply recorded when the model answers with empty content.
pub const EMPTY_REPLY: &str = "Sorry, I couldn't generate a response. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    fn label(self) -> &'static str {
        match self {
            ChatRole::User => "User",
            ChatRole::Assistant => "Assistant",
        }
    }
}

/// One turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Prompt tokens for user turns, completion tokens for assistant turns.
    pub tokens_used: u64,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>, tokens_used: u64) -> Self {
        Self {
            role,
            content: content.into(),
            tokens_used,
            sent_at: Utc::now(),
        }
    }
}

/// Bounded conversation log; the oldest turns fall off first.
#[derive(Debug)]
pub struct ChatHistory {
    messages: Mutex<VecDeque<ChatMessage>>,
    capacity: usize,
}

impl ChatHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append one exchange atomically, so concurrent chats never interleave
    /// a question with another caller's answer.
    pub fn push_exchange(&self, question: ChatMessage, answer: ChatMessage) {
        let mut messages = self.messages.lock();
        for message in [question, answer] {
            if messages.len() == self.capacity {
                messages.pop_front();
            }
            messages.push_back(message);
        }
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChatHistory {
    fn default() -> Self {
        Self::new(MAX_CHAT_HISTORY)
    }
}

/// Render a conversation as a Markdown document.
pub fn render_chat(messages: &[ChatMessage]) -> String {
    let mut out = String::from("# Chat history\n\n");
    for message in messages {
        out.push_str(&format!(
            "### {} ({})\n\n{}\n\n",
            message.role.label(),
            message.sent_at.format("%H:%M:%S"),
            message.content.trim_end()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_turns_fall_off() {
        let history = ChatHistory::new(4);
        for i in 0..3 {
            history.push_exchange(
                ChatMessage::new(ChatRole::User, format!("q{i}"), 1),
                ChatMessage::new(ChatRole::Assistant, format!("a{i}"), 2),
            );
        }
        let contents: Vec<String> = history.snapshot().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn default_keeps_twenty_turns() {
        let history = ChatHistory::default();
        for _ in 0..15 {
            history.push_exchange(
                ChatMessage::new(ChatRole::User, "q", 1),
                ChatMessage::new(ChatRole::Assistant, "a", 1),
            );
        }
        assert_eq!(history.len(), MAX_CHAT_HISTORY);
    }

    #[test]
    fn render_labels_each_turn() {
        let rendered = render_chat(&[
            ChatMessage::new(ChatRole::User, "What is a monad?", 5),
            ChatMessage::new(ChatRole::Assistant, "A monoid in the category of endofunctors.\n", 9),
        ]);
        assert!(rendered.starts_with("# Chat history\n\n### User ("));
        assert!(rendered.contains("What is a monad?\n\n### Assistant ("));
        assert!(rendered.ends_with("endofunctors.\n\n"));
    }

    #[test]
    fn roles_serialise_in_snake_case() {
        let json = serde_json::to_string(&ChatMessage::new(ChatRole::Assistant, "hi", 3)).unwrap();
        assert!(json.contains(r#""role":"assistant""#));
        assert!(json.contains(r#""tokens_used":3"#));
    }
}
