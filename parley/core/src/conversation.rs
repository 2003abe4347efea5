//! Conversations
//!
//! A conversation owns an ordered, id-unique list of messages plus the
//! metadata the store needs to decide when to fetch, cache and rename it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::messages::{Message, MessageId};

/// Unique identifier for a conversation
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    /// Wrap a server-assigned id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Locally assigned id, used when remote creation fails
    #[must_use]
    pub fn local() -> Self {
        Self(format!("local_{}", Uuid::new_v4()))
    }

    /// Whether the server has never seen this conversation
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with("local_")
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A conversation and its messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Unique conversation id
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Messages in ascending timestamp order, unique by id
    pub messages: Vec<Message>,
    /// Whether replies use research prompts
    pub is_research_mode: bool,
    /// Tombstoned locally; rejects every mutation
    pub is_soft_deleted: bool,
    /// Message count reported by the server
    pub total_message_count: u32,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// When the conversation last changed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create an empty conversation
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            is_research_mode: false,
            is_soft_deleted: false,
            total_message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Position of a message by id
    #[must_use]
    pub fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// Look up a message by id
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Whether a message with this id is held
    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.position(id).is_some()
    }

    /// Sort messages ascending by timestamp (stable)
    pub fn sort_messages(&mut self) {
        self.messages.sort_by_key(|m| m.timestamp);
    }

    /// Whether the user has written anything with text yet
    #[must_use]
    pub fn has_user_text(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.is_user && !m.text.trim().is_empty())
    }
}

/// Derive a conversation title from the first user message
///
/// Punctuation is stripped, whitespace collapsed and the result cut at
/// `max_chars` characters. Falls back to `fallback` when nothing is left.
#[must_use]
pub fn derive_title(text: &str, max_chars: usize, fallback: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let title: String = collapsed.chars().take(max_chars).collect();
    let title = title.trim_end();

    if title.is_empty() {
        fallback.to_string()
    } else {
        title.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_strips_punctuation() {
        assert_eq!(derive_title("Hello, world!", 30, "New Chat"), "Hello world");
    }

    #[test]
    fn test_derive_title_truncates() {
        let text = "Can you explain how the borrow checker handles closures?";
        let title = derive_title(text, 30, "New Chat");
        assert_eq!(title.chars().count(), 30);
        assert_eq!(title, "Can you explain how the borrow");
    }

    #[test]
    fn test_derive_title_fallback() {
        assert_eq!(derive_title("?!...", 30, "New Chat"), "New Chat");
        assert_eq!(derive_title("   ", 30, "New Chat"), "New Chat");
    }

    #[test]
    fn test_derive_title_keeps_unicode() {
        assert_eq!(derive_title("¿Qué tal?", 30, "New Chat"), "¿Qué tal");
    }

    #[test]
    fn test_local_conversation_id() {
        let id = ConversationId::local();
        assert!(id.is_local());
        assert!(!ConversationId::new("65a1f0c2e4b0a1b2c3d4e5f6").is_local());
    }

    #[test]
    fn test_sort_messages() {
        let mut conv = Conversation::new(ConversationId::new("c1"), "t");
        let later = Message::assistant(MessageId::new("b"), "second");
        let earlier = Message::assistant(MessageId::new("a"), "first")
            .with_timestamp(later.timestamp - chrono::Duration::seconds(5));
        conv.messages.push(later);
        conv.messages.push(earlier);
        conv.sort_messages();
        assert_eq!(conv.messages[0].id, MessageId::new("a"));
    }
}
