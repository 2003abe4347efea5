//! Frame Decoder
//!
//! Turns the event-stream body into [`DecodedFrame`]s.
//!
//! # Frame Format
//!
//! ```text
//! event: ai_chunk
//! data: {"messageId":"...","content":" there",
//! data:  "fullContent":"Hi there"}
//!
//! ```
//!
//! A frame is terminated by a blank line. `data:` lines are concatenated and
//! trimmed. Lines may end in `\n` or `\r\n`; comment lines (`:`) and the
//! `id:` / `retry:` fields are ignored.
//!
//! # Buffer Contract
//!
//! The decoder is handed the *entire* text received so far on every call, not
//! just the newest chunk. It remembers how far it has processed, looks for the
//! last blank-line delimiter after that point and decodes everything before
//! it. The trailing partial frame is left untouched until a later call, so a
//! delimiter split across two network reads is handled naturally.

use serde_json::Value;

use super::event::{normalize, EventType, StreamEvent};
use crate::messages::MessageId;

/// Accumulates raw body bytes as text
///
/// UTF-8 is decoded incrementally: an incomplete multi-byte sequence at the
/// end of a chunk is held back until the rest of it arrives.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    text: String,
    pending: Vec<u8>,
}

impl StreamBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);

        loop {
            let (valid_up_to, error_len) = match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    self.pending.clear();
                    return;
                }
                Err(err) => (err.valid_up_to(), err.error_len()),
            };

            self.text
                .push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));
            match error_len {
                Some(bad) => {
                    self.text.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid_up_to + bad);
                }
                None => {
                    // Incomplete sequence at the end; wait for more bytes
                    self.pending.drain(..valid_up_to);
                    return;
                }
            }
        }
    }

    /// Flush any held-back bytes at end of stream
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            self.text.push_str(&String::from_utf8_lossy(&self.pending));
            self.pending.clear();
        }
    }

    /// Everything received so far
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether nothing has been received
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.pending.is_empty()
    }
}

/// One decoded frame
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    /// Canonical event
    pub event: StreamEvent,
    /// Raw (trimmed) payload text
    pub raw_payload: String,
}

impl DecodedFrame {
    /// Canonical type (after normalisation)
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }

    /// Embedded entity id, if any
    #[must_use]
    pub fn entity_id(&self) -> Option<&MessageId> {
        self.event.entity_id()
    }

    /// Deduplication key: type, entity id and a payload prefix
    ///
    /// Chunk keys also carry the accumulated text length. Cumulative
    /// payloads soon share their first characters, so a prefix alone would
    /// swallow every chunk after that point.
    #[must_use]
    pub fn dedup_key(&self, prefix_chars: usize) -> String {
        let prefix: String = self.raw_payload.chars().take(prefix_chars).collect();
        let mut key = format!(
            "{}|{}|{}",
            self.event_type(),
            self.entity_id().map_or("", MessageId::as_str),
            prefix
        );
        if let StreamEvent::AiChunk(chunk) = &self.event {
            key.push_str(&format!("|{}", chunk.full_content.chars().count()));
        }
        key
    }
}

/// Incremental frame decoder
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Byte offset up to which the buffer has been decoded
    processed: usize,
    /// Frames dropped because their payload could not be parsed
    protocol_errors: usize,
}

impl FrameDecoder {
    /// Create a decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode frames completed since the previous call
    ///
    /// `buffer` must be the full text received so far and must only ever
    /// grow between calls.
    pub fn decode(&mut self, buffer: &str) -> Vec<DecodedFrame> {
        let Some(region) = buffer.get(self.processed..) else {
            return Vec::new();
        };
        let Some(end) = last_delimiter_end(region) else {
            return Vec::new();
        };

        let complete = &region[..end];
        self.processed += end;

        split_frames(complete)
            .into_iter()
            .filter_map(|raw| self.parse(&raw))
            .collect()
    }

    /// Bytes of the buffer already decoded
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Number of frames dropped as malformed
    #[must_use]
    pub fn protocol_errors(&self) -> usize {
        self.protocol_errors
    }

    fn parse(&mut self, raw: &RawFrame) -> Option<DecodedFrame> {
        match parse_frame(raw) {
            Ok(frame) => frame,
            Err(reason) => {
                self.protocol_errors += 1;
                tracing::warn!(
                    event_type = raw.event_type.as_deref().unwrap_or(""),
                    error = %reason,
                    "Dropping malformed stream frame"
                );
                None
            }
        }
    }
}

/// Scan the whole buffer for a completion frame
///
/// Used once when the connection ends. The final frame need not be
/// terminated by a blank line. Returns the last parseable `ai_complete`.
#[must_use]
pub fn final_sweep(buffer: &str) -> Option<DecodedFrame> {
    let mut frames = split_frames(buffer);
    if let Some(tail) = trailing_frame(buffer) {
        frames.push(tail);
    }

    frames
        .iter()
        .rev()
        .filter(|raw| raw.event_type.as_deref().and_then(EventType::parse) == Some(EventType::AiComplete))
        .find_map(|raw| parse_frame(raw).ok().flatten())
        .filter(|frame| frame.event_type() == EventType::AiComplete)
}

// ============================================================================
// Line Scanning
// ============================================================================

/// A frame split into its fields, before JSON parsing
#[derive(Debug, Default, PartialEq, Eq)]
struct RawFrame {
    event_type: Option<String>,
    data: String,
}

impl RawFrame {
    fn is_empty(&self) -> bool {
        self.event_type.is_none() && self.data.is_empty()
    }

    fn apply_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.trim().to_string()),
            "data" => self.data.push_str(value),
            _ => {}
        }
    }
}

/// Lines with their terminator stripped, each paired with its end offset
fn lines_with_ends(text: &str) -> impl Iterator<Item = (&str, usize)> {
    let mut start = 0;
    text.match_indices('\n').map(move |(idx, _)| {
        let line = text[start..idx].strip_suffix('\r').unwrap_or(&text[start..idx]);
        start = idx + 1;
        (line, idx + 1)
    })
}

/// Offset just past the last blank line in `region`
fn last_delimiter_end(region: &str) -> Option<usize> {
    lines_with_ends(region)
        .filter(|(line, _)| line.is_empty())
        .map(|(_, end)| end)
        .last()
}

/// Split text made of complete frames
fn split_frames(complete: &str) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    let mut current = RawFrame::default();

    for (line, _) in lines_with_ends(complete) {
        if line.is_empty() {
            if !current.is_empty() {
                frames.push(std::mem::take(&mut current));
            }
        } else {
            current.apply_line(line);
        }
    }
    frames
}

/// The unterminated frame at the end of the buffer, if any
fn trailing_frame(buffer: &str) -> Option<RawFrame> {
    let start = last_delimiter_end(buffer).unwrap_or(0);
    let mut frame = RawFrame::default();
    for line in buffer[start..].lines() {
        if !line.is_empty() {
            frame.apply_line(line);
        }
    }
    (!frame.is_empty()).then_some(frame)
}

/// Parse a raw frame. `Ok(None)` means the frame is ignored, not malformed.
fn parse_frame(raw: &RawFrame) -> Result<Option<DecodedFrame>, String> {
    let Some(event_type) = raw.event_type.as_deref().and_then(EventType::parse) else {
        tracing::debug!(
            event_type = raw.event_type.as_deref().unwrap_or(""),
            "Ignoring frame with unrecognised type"
        );
        return Ok(None);
    };

    let raw_payload = raw.data.trim().to_string();
    let payload = if raw_payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str::<Value>(&raw_payload).map_err(|e| e.to_string())?
    };

    let event = normalize(event_type, &payload)?;
    Ok(Some(DecodedFrame { event, raw_payload }))
}
