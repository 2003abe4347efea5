//! Wire Types
//!
//! JSON shapes exchanged with the chat API. The server has shipped several
//! spellings of the same fields over time (`_id` vs `id`, `text` vs
//! `content`, epoch millis vs RFC 3339), so every field is optional here and
//! the `into_*` conversions pick whichever spelling is present.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{Conversation, ConversationId};
use crate::messages::{Attachment, Message, MessageId, PromptType};

/// Parse a timestamp given as RFC 3339 text or epoch milliseconds
#[must_use]
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// A message as the server sends it
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteMessage {
    /// Object id spelling
    #[serde(rename = "_id")]
    pub object_id: Option<String>,
    /// Plain id spelling
    pub id: Option<String>,
    /// Text spelling
    pub text: Option<String>,
    /// Content spelling
    pub content: Option<String>,
    /// Author flag
    #[serde(rename = "isUser", alias = "is_user")]
    pub is_user: Option<bool>,
    /// Author role (`user` / `assistant`)
    pub role: Option<String>,
    /// Creation time
    pub timestamp: Option<Value>,
    /// Creation time, alternate spelling
    #[serde(rename = "createdAt", alias = "created_at")]
    pub created_at: Option<Value>,
    /// Image URLs or `{url}` objects
    #[serde(default)]
    pub images: Vec<Value>,
    /// File attachments
    #[serde(default)]
    pub files: Vec<Attachment>,
}

impl RemoteMessage {
    /// The id, whichever spelling the server used
    #[must_use]
    pub fn message_id(&self) -> Option<MessageId> {
        self.object_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|id| !id.is_empty())
            .map(MessageId::new)
    }

    /// Whether the body has the minimum a message needs
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.message_id().is_some() || self.text.is_some() || self.content.is_some()
    }

    /// Convert into the domain message
    ///
    /// A missing id is replaced by a `local_` id so the message stays
    /// addressable; a missing timestamp becomes "now".
    #[must_use]
    pub fn into_message(self) -> Message {
        let id = self.message_id().unwrap_or_else(MessageId::local);
        let is_user = self
            .is_user
            .unwrap_or_else(|| self.role.as_deref() == Some("user"));
        let timestamp = self
            .timestamp
            .as_ref()
            .and_then(parse_timestamp)
            .or_else(|| self.created_at.as_ref().and_then(parse_timestamp))
            .unwrap_or_else(Utc::now);
        let images = self
            .images
            .iter()
            .filter_map(|img| match img {
                Value::String(url) => Some(url.clone()),
                Value::Object(obj) => obj.get("url").and_then(Value::as_str).map(String::from),
                _ => None,
            })
            .collect();

        Message {
            id,
            text: self.text.or(self.content).unwrap_or_default(),
            is_user,
            timestamp,
            images,
            files: self.files,
            is_streaming: false,
            is_thinking: false,
        }
    }
}

/// A conversation as the server sends it
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RemoteConversation {
    /// Object id spelling
    #[serde(rename = "_id")]
    pub object_id: Option<String>,
    /// Plain id spelling
    pub id: Option<String>,
    /// Title
    pub title: Option<String>,
    /// Research-mode flag
    #[serde(rename = "isResearchMode", alias = "is_research_mode")]
    pub is_research_mode: Option<bool>,
    /// Total message count
    #[serde(rename = "messageCount", alias = "message_count")]
    pub message_count: Option<u32>,
    /// Creation time
    #[serde(rename = "createdAt", alias = "created_at")]
    pub created_at: Option<Value>,
    /// Last update time
    #[serde(rename = "updatedAt", alias = "updated_at")]
    pub updated_at: Option<Value>,
}

impl RemoteConversation {
    /// The id, whichever spelling the server used
    #[must_use]
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.object_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|id| !id.is_empty())
            .map(ConversationId::new)
    }

    /// Convert into a domain conversation with no messages loaded
    #[must_use]
    pub fn into_conversation(self, fallback_title: &str) -> Option<Conversation> {
        let id = self.conversation_id()?;
        let mut conv = Conversation::new(id, self.title.unwrap_or_else(|| fallback_title.to_string()));
        conv.is_research_mode = self.is_research_mode.unwrap_or(false);
        conv.total_message_count = self.message_count.unwrap_or(0);
        if let Some(created) = self.created_at.as_ref().and_then(parse_timestamp) {
            conv.created_at = created;
        }
        if let Some(updated) = self.updated_at.as_ref().and_then(parse_timestamp) {
            conv.updated_at = updated;
        }
        Some(conv)
    }
}

/// Either a bare entity or one wrapped in a named envelope
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ConversationEnvelope {
    /// `{"conversation": {...}}`
    Wrapped {
        /// The wrapped entity
        conversation: RemoteConversation,
    },
    /// `{"data": {...}}`
    Data {
        /// The wrapped entity
        data: RemoteConversation,
    },
    /// The entity itself
    Bare(RemoteConversation),
}

impl ConversationEnvelope {
    /// Unwrap the entity
    #[must_use]
    pub fn into_inner(self) -> RemoteConversation {
        match self {
            Self::Wrapped { conversation } => conversation,
            Self::Data { data } => data,
            Self::Bare(conversation) => conversation,
        }
    }
}

/// Server pagination block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Pagination {
    /// Page returned
    pub page: Option<u32>,
    /// Total number of pages
    pub pages: Option<u32>,
    /// Total number of messages
    pub total: Option<u32>,
}

/// One page of messages
#[derive(Clone, Debug, Default, Deserialize)]
pub struct MessagePage {
    /// Messages on this page
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
    /// Pagination info, when the server reports it
    pub pagination: Option<Pagination>,
}

/// Body of the streaming send request
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Target conversation
    pub conversation_id: ConversationId,
    /// User text
    pub message: String,
    /// Uploaded attachments
    pub attachments: Vec<Attachment>,
    /// Prompt style
    pub prompt_type: PromptType,
    /// Device-local date (`YYYY-MM-DD`)
    pub device_date: String,
    /// Device-local time (`HH:MM:SS`)
    pub device_time: String,
    /// Device clock, epoch milliseconds
    pub device_timestamp: i64,
}

impl SendRequest {
    /// Build a request stamped with the device clock
    pub fn new(
        conversation_id: ConversationId,
        message: impl Into<String>,
        attachments: Vec<Attachment>,
        prompt_type: PromptType,
    ) -> Self {
        let now = chrono::Local::now();
        Self {
            conversation_id,
            message: message.into(),
            attachments,
            prompt_type,
            device_date: now.format("%Y-%m-%d").to_string(),
            device_time: now.format("%H:%M:%S").to_string(),
            device_timestamp: now.timestamp_millis(),
        }
    }
}
