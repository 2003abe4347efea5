//! Stream Events
//!
//! Canonical events produced by the frame decoder. Every payload shape the
//! server has ever used for a given event type is folded into one variant
//! here; nothing past this module inspects raw JSON.
//!
//! # Chunk Shapes
//!
//! `ai_chunk` payloads are matched against an ordered list of shapes. The
//! first matcher that recognises the payload wins:
//!
//! | Order | Shape                                            |
//! |-------|--------------------------------------------------|
//! | 1     | `{content, fullContent}` at the top level        |
//! | 2     | `{data: {content, fullContent}}`                 |
//! | 3     | `{chunk: {content, fullContent}}`                |
//! | 4     | `{message: {text \| content}}`                   |
//! | 5     | `{delta, text}` (`text` is the running total)    |
//! | 6     | a bare JSON string                               |
//!
//! The chunk text is always cumulative. When a shape only carries one text
//! field, that field is taken as the running total.

use serde_json::{Map, Value};

use crate::error::StreamError;
use crate::messages::{Message, MessageId};
use crate::transport::wire::RemoteMessage;

/// Recognised frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Server echo of the user's message
    UserMessage,
    /// Assistant reply is starting
    AiStart,
    /// Intermediate reasoning step (not surfaced)
    AiThinkingStep,
    /// Cumulative reply text so far
    AiChunk,
    /// Reply finished
    AiComplete,
    /// Terminal failure (or a mis-tagged success)
    Error,
}

impl EventType {
    /// Parse a wire type name
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "user_message" => Some(Self::UserMessage),
            "ai_start" => Some(Self::AiStart),
            "ai_thinking_step" => Some(Self::AiThinkingStep),
            "ai_chunk" => Some(Self::AiChunk),
            "ai_complete" => Some(Self::AiComplete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire type name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AiStart => "ai_start",
            Self::AiThinkingStep => "ai_thinking_step",
            Self::AiChunk => "ai_chunk",
            Self::AiComplete => "ai_complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalised `ai_chunk` payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkPayload {
    /// Assistant message id, when the server sent one
    pub message_id: Option<MessageId>,
    /// Text added by this chunk (informational)
    pub content: String,
    /// Complete reply text so far
    pub full_content: String,
}

/// A decoded, normalised stream event
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Server-confirmed copy of the user's message
    UserMessage(Message),
    /// Assistant reply started
    AiStart {
        /// Assistant message id, when the server sent one
        message_id: Option<MessageId>,
    },
    /// Reasoning step, ignored by consumers
    ThinkingStep,
    /// Cumulative reply text
    AiChunk(ChunkPayload),
    /// Finalised assistant message
    AiComplete(Message),
    /// Server-reported failure
    Error {
        /// Error description
        message: String,
        /// HTTP-style status code, if reported
        status: Option<u16>,
        /// Seconds to wait before retrying, if reported
        retry_after_secs: Option<u64>,
    },
}

impl StreamEvent {
    /// Canonical type of this event
    ///
    /// May differ from the frame's wire type after normalisation.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::UserMessage(_) => EventType::UserMessage,
            Self::AiStart { .. } => EventType::AiStart,
            Self::ThinkingStep => EventType::AiThinkingStep,
            Self::AiChunk(_) => EventType::AiChunk,
            Self::AiComplete(_) => EventType::AiComplete,
            Self::Error { .. } => EventType::Error,
        }
    }

    /// Id of the entity the event refers to, if any
    #[must_use]
    pub fn entity_id(&self) -> Option<&MessageId> {
        match self {
            Self::UserMessage(m) | Self::AiComplete(m) => Some(&m.id),
            Self::AiStart { message_id } => message_id.as_ref(),
            Self::AiChunk(chunk) => chunk.message_id.as_ref(),
            Self::ThinkingStep | Self::Error { .. } => None,
        }
    }

    /// Whether this event ends the session
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AiComplete(_) | Self::Error { .. })
    }

    /// Classify an error event
    ///
    /// Returns `None` for non-error events.
    #[must_use]
    pub fn to_stream_error(&self) -> Option<StreamError> {
        let Self::Error {
            message,
            status,
            retry_after_secs,
        } = self
        else {
            return None;
        };

        let lowered = message.to_lowercase();
        if *status == Some(429) || lowered.contains("rate limit") || lowered.contains("too many requests") {
            Some(StreamError::RateLimited {
                message: message.clone(),
                retry_after_secs: *retry_after_secs,
            })
        } else {
            Some(StreamError::Server {
                status: *status,
                message: message.clone(),
            })
        }
    }
}

/// Normalise a frame payload into its canonical event
///
/// # Errors
///
/// Returns a description of the problem when the payload does not match any
/// known shape for its type.
pub fn normalize(event_type: EventType, payload: &Value) -> Result<StreamEvent, String> {
    match event_type {
        EventType::UserMessage => message_body(payload)
            .map(|m| StreamEvent::UserMessage(finish_message(m, true)))
            .ok_or_else(|| "user_message without a message body".to_string()),
        EventType::AiStart => Ok(StreamEvent::AiStart {
            message_id: id_field(payload)
                .or_else(|| payload.get("message").and_then(id_field)),
        }),
        EventType::AiThinkingStep => Ok(StreamEvent::ThinkingStep),
        EventType::AiChunk => CHUNK_MATCHERS
            .iter()
            .find_map(|matcher| matcher(payload))
            .map(StreamEvent::AiChunk)
            .ok_or_else(|| "ai_chunk payload has no recognised shape".to_string()),
        EventType::AiComplete => completion_body(payload)
            .map(StreamEvent::AiComplete)
            .ok_or_else(|| "ai_complete without a message body".to_string()),
        EventType::Error => Ok(normalize_error(payload)),
    }
}

// ============================================================================
// Chunk Shape Matchers
// ============================================================================

type ChunkMatcher = fn(&Value) -> Option<ChunkPayload>;

const CHUNK_MATCHERS: [ChunkMatcher; 6] = [
    match_flat_chunk,
    match_data_chunk,
    match_nested_chunk,
    match_message_chunk,
    match_delta_chunk,
    match_bare_string_chunk,
];

fn text_field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| obj.get(*name).and_then(Value::as_str))
        .map(String::from)
}

fn chunk_from_object(obj: &Map<String, Value>) -> Option<ChunkPayload> {
    let full = text_field(obj, &["fullContent", "full_content"]);
    let content = text_field(obj, &["content"]);
    if full.is_none() && content.is_none() {
        return None;
    }
    let full_content = full.clone().or_else(|| content.clone()).unwrap_or_default();
    Some(ChunkPayload {
        message_id: object_id(obj),
        content: content.unwrap_or_default(),
        full_content,
    })
}

fn match_flat_chunk(payload: &Value) -> Option<ChunkPayload> {
    chunk_from_object(payload.as_object()?)
}

fn match_data_chunk(payload: &Value) -> Option<ChunkPayload> {
    let mut chunk = chunk_from_object(payload.get("data")?.as_object()?)?;
    if chunk.message_id.is_none() {
        chunk.message_id = id_field(payload);
    }
    Some(chunk)
}

fn match_nested_chunk(payload: &Value) -> Option<ChunkPayload> {
    let mut chunk = chunk_from_object(payload.get("chunk")?.as_object()?)?;
    if chunk.message_id.is_none() {
        chunk.message_id = id_field(payload);
    }
    Some(chunk)
}

fn match_message_chunk(payload: &Value) -> Option<ChunkPayload> {
    let message = payload.get("message")?.as_object()?;
    let text = text_field(message, &["text", "content"])?;
    Some(ChunkPayload {
        message_id: object_id(message),
        content: String::new(),
        full_content: text,
    })
}

fn match_delta_chunk(payload: &Value) -> Option<ChunkPayload> {
    let obj = payload.as_object()?;
    let text = text_field(obj, &["text"])?;
    Some(ChunkPayload {
        message_id: object_id(obj),
        content: text_field(obj, &["delta"]).unwrap_or_default(),
        full_content: text,
    })
}

fn match_bare_string_chunk(payload: &Value) -> Option<ChunkPayload> {
    payload.as_str().map(|text| ChunkPayload {
        message_id: None,
        content: String::new(),
        full_content: text.to_string(),
    })
}

// ============================================================================
// Message Bodies
// ============================================================================

fn object_id(obj: &Map<String, Value>) -> Option<MessageId> {
    ["messageId", "message_id", "_id", "id"]
        .iter()
        .find_map(|name| obj.get(*name).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .map(MessageId::new)
}

fn id_field(payload: &Value) -> Option<MessageId> {
    payload.as_object().and_then(object_id)
}

/// Find the message object in a message-bearing payload
fn message_body(payload: &Value) -> Option<RemoteMessage> {
    let candidates = ["userMessage", "user_message", "message", "data"];
    let inner = candidates
        .iter()
        .filter_map(|key| payload.get(*key))
        .find(|v| v.is_object())
        .unwrap_or(payload);

    let remote: RemoteMessage = serde_json::from_value(inner.clone()).ok()?;
    remote.is_well_formed().then_some(remote)
}

fn finish_message(remote: RemoteMessage, is_user: bool) -> Message {
    let mut message = remote.into_message();
    message.is_user = is_user;
    message
}

/// `ai_complete` carries either a full message or just the final text
fn completion_body(payload: &Value) -> Option<Message> {
    let obj = payload.as_object()?;
    if let Some(text) = text_field(obj, &["fullContent", "full_content"]) {
        let id = object_id(obj).unwrap_or_else(MessageId::local);
        return Some(Message::assistant(id, text));
    }
    message_body(payload).map(|m| finish_message(m, false))
}

/// Error payload, with the mis-tagged success check
///
/// Some server builds tag a successful user-message echo as `error`. A
/// payload with `success: true` and a well-formed user message body is
/// rewritten to [`StreamEvent::UserMessage`].
fn normalize_error(payload: &Value) -> StreamEvent {
    let success = payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if success {
        if let Some(remote) = message_body(payload).filter(|m| m.text.is_some() || m.content.is_some()) {
            tracing::debug!("Error frame carries a successful user message, treating as echo");
            return StreamEvent::UserMessage(finish_message(remote, true));
        }
    }

    let message = match payload {
        Value::String(s) => s.clone(),
        Value::Object(obj) => text_field(obj, &["error", "message", "detail"])
            .or_else(|| {
                obj.get("error")
                    .and_then(Value::as_object)
                    .and_then(|e| text_field(e, &["message"]))
            })
            .unwrap_or_else(|| "Stream failed".to_string()),
        _ => "Stream failed".to_string(),
    };
    let status = ["status", "statusCode", "code"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_u64))
        .and_then(|s| u16::try_from(s).ok());
    let retry_after_secs = ["retryAfter", "retry_after"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_u64));

    StreamEvent::Error {
        message,
        status,
        retry_after_secs,
    }
}
