//! Message Types
//!
//! The message half of the data model: identifiers, attachments and the
//! `Message` record itself. Conversations live in [`crate::conversation`].
//!
//! # Identifier Conventions
//!
//! Ids minted on the device carry a prefix so the store can tell them apart
//! from server records without any extra bookkeeping:
//!
//! | Prefix     | Minted for                                   |
//! |------------|----------------------------------------------|
//! | `temp_`    | optimistic user messages awaiting their echo |
//! | `stream_`  | assistant placeholders while a reply streams |
//! | `local_`   | anything else created offline                |
//!
//! Such ids are *transient*: they are never sent to the server for deletion
//! and survive a page-1 refresh only while the server has no counterpart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefixes of locally minted ids
const TRANSIENT_PREFIXES: [&str; 3] = ["temp_", "stream_", "local_"];

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Wrap a server-assigned id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for an optimistic user message
    #[must_use]
    pub fn temp() -> Self {
        Self(format!("temp_{}", Uuid::new_v4()))
    }

    /// Id for a streaming assistant placeholder
    #[must_use]
    pub fn placeholder() -> Self {
        Self(format!("stream_{}", Uuid::new_v4()))
    }

    /// Id for any other locally created message
    #[must_use]
    pub fn local() -> Self {
        Self(format!("local_{}", Uuid::new_v4()))
    }

    /// Borrow the raw id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was minted on the device
    #[must_use]
    pub fn is_transient(&self) -> bool {
        TRANSIENT_PREFIXES.iter().any(|p| self.0.starts_with(p))
    }

    /// Whether this id looks like a genuine server record
    ///
    /// Server records use 24-digit hex object ids or UUIDs.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        if self.is_transient() {
            return false;
        }
        let id = self.0.as_str();
        (id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit())) || Uuid::parse_str(id).is_ok()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// An uploaded file, as returned by the upload endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attachment {
    /// Where the file can be fetched from
    pub url: String,
    /// Original file name
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(alias = "mime_type")]
    pub mime_type: String,
}

impl Attachment {
    /// Whether the attachment is an image
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Prompt style requested for a reply
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PromptType {
    /// Regular chat
    #[default]
    Default,
    /// Research mode (longer, sourced answers)
    Research,
    /// Any other server-defined prompt
    Custom(String),
}

impl PromptType {
    /// Wire name
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Default => "default",
            Self::Research => "research",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for PromptType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "default" => Self::Default,
            "research" => Self::Research,
            _ => Self::Custom(value),
        }
    }
}

impl From<PromptType> for String {
    fn from(value: PromptType) -> Self {
        value.as_str().to_string()
    }
}

impl std::str::FromStr for PromptType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

/// A chat message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id within the conversation
    pub id: MessageId,
    /// Message text (may be empty while streaming)
    pub text: String,
    /// Whether the user wrote this message
    pub is_user: bool,
    /// When the message was created
    pub timestamp: DateTime<Utc>,
    /// Image URLs
    pub images: Vec<String>,
    /// Non-image attachments
    pub files: Vec<Attachment>,
    /// Whether the text is still arriving
    pub is_streaming: bool,
    /// Whether the assistant has not produced any text yet
    pub is_thinking: bool,
}

impl Message {
    /// Optimistic user message with a `temp_` id
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        let (images, files): (Vec<_>, Vec<_>) = attachments.into_iter().partition(Attachment::is_image);
        Self {
            id: MessageId::temp(),
            text: text.into(),
            is_user: true,
            timestamp: Utc::now(),
            images: images.into_iter().map(|a| a.url).collect(),
            files,
            is_streaming: false,
            is_thinking: false,
        }
    }

    /// Empty assistant placeholder shown while a reply streams in
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            id: MessageId::placeholder(),
            text: String::new(),
            is_user: false,
            timestamp: Utc::now(),
            images: Vec::new(),
            files: Vec::new(),
            is_streaming: true,
            is_thinking: true,
        }
    }

    /// Finalised assistant message
    pub fn assistant(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            is_user: false,
            timestamp: Utc::now(),
            images: Vec::new(),
            files: Vec::new(),
            is_streaming: false,
            is_thinking: false,
        }
    }

    /// Set the timestamp
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the message carries images or files
    #[must_use]
    pub fn has_attachments(&self) -> bool {
        !self.images.is_empty() || !self.files.is_empty()
    }

    /// Whether the message has any visible content
    #[must_use]
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty() || self.has_attachments()
    }
}
