//! Merge Rules
//!
//! Pure functions that fold fetched pages and incoming updates into a
//! conversation's message list. Every function leaves the list id-unique and
//! sorted ascending by timestamp.

use std::collections::HashSet;

use chrono::Duration;

use crate::messages::{Message, MessageId};
use crate::transport::RemoteMessage;

/// Convert a fetched message, suppressing empty assistant stubs
///
/// A non-user message with no text and no attachments is dropped unless its
/// id marks it as a genuine persisted record, in which case it is kept with
/// empty text.
#[must_use]
pub fn accept_fetched(remote: RemoteMessage) -> Option<Message> {
    let message = remote.into_message();
    if message.is_user || message.has_content() || message.id.is_persisted() {
        Some(message)
    } else {
        tracing::debug!(message_id = %message.id, "Suppressing empty fetched message");
        None
    }
}

/// Drop later duplicates of the same id, keeping the first
fn dedup_by_id(messages: &mut Vec<Message>) {
    let mut seen = HashSet::new();
    messages.retain(|m| seen.insert(m.id.clone()));
}

fn sort(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.timestamp);
}

/// How far a server timestamp may trail the device clock
const CLOCK_SKEW_SECS: i64 = 5;

/// Whether `fetched` already holds the server copy of a local message
///
/// Text matches only count for server messages no older than the local one
/// (give or take clock skew); an earlier message with the same text is a
/// different turn.
fn has_server_copy(fetched: &[Message], local: &Message) -> bool {
    let earliest = local.timestamp - Duration::seconds(CLOCK_SKEW_SECS);
    fetched.iter().any(|m| {
        m.id == local.id
            || (m.is_user == local.is_user
                && m.timestamp >= earliest
                && !local.text.trim().is_empty()
                && m.text.trim() == local.text.trim())
    })
}

/// Merge a fresh first page
///
/// The fetched page replaces the list, except that locally minted messages
/// with no server counterpart (an optimistic send, a streaming placeholder)
/// are carried over.
#[must_use]
pub fn merge_first_page(existing: &[Message], fetched: Vec<Message>) -> Vec<Message> {
    let mut merged = fetched;
    dedup_by_id(&mut merged);

    let carried: Vec<Message> = existing
        .iter()
        .filter(|m| m.id.is_transient() && !has_server_copy(&merged, m))
        .cloned()
        .collect();
    merged.extend(carried);

    sort(&mut merged);
    merged
}

/// Merge an older page: unseen fetched messages are prepended, then the list
/// is re-sorted
#[must_use]
pub fn merge_older_page(existing: &[Message], fetched: Vec<Message>) -> Vec<Message> {
    let known: HashSet<&MessageId> = existing.iter().map(|m| &m.id).collect();
    let mut merged: Vec<Message> = fetched
        .into_iter()
        .filter(|m| !known.contains(&m.id))
        .collect();
    dedup_by_id(&mut merged);
    merged.extend(existing.iter().cloned());

    sort(&mut merged);
    merged
}

/// Outcome of [`upsert`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upsert {
    /// A new message was inserted
    Inserted,
    /// An existing message changed (or is streaming)
    Updated,
    /// Nothing changed
    Unchanged,
}

impl Upsert {
    /// Whether observers should be told
    #[must_use]
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Insert or update by id
///
/// Empty incoming text never overwrites existing non-empty text; only the
/// streaming flags change then. An identical update is a no-op unless the
/// message is streaming, in which case every update counts.
pub fn upsert(messages: &mut Vec<Message>, incoming: Message) -> Upsert {
    let Some(index) = messages.iter().position(|m| m.id == incoming.id) else {
        messages.push(incoming);
        sort(messages);
        return Upsert::Inserted;
    };
    let existing = &mut messages[index];

    let mut next = incoming;
    if next.text.is_empty() && !existing.text.is_empty() {
        next.text = existing.text.clone();
    }

    if *existing == next && !next.is_streaming {
        return Upsert::Unchanged;
    }

    let resort = existing.timestamp != next.timestamp;
    *existing = next;
    if resort {
        sort(messages);
    }
    Upsert::Updated
}

/// Replace the message `old_id` with `replacement` in one step
///
/// When `replacement`'s id is already present elsewhere, `old_id` is simply
/// removed and the present copy updated, so no duplicate appears.
pub fn replace(messages: &mut Vec<Message>, old_id: &MessageId, replacement: Message) {
    let old_index = messages.iter().position(|m| &m.id == old_id);
    let dup_index = messages
        .iter()
        .position(|m| m.id == replacement.id && &m.id != old_id);

    match (old_index, dup_index) {
        (Some(old), None) => messages[old] = replacement,
        (Some(old), Some(dup)) => {
            messages[dup] = replacement;
            messages.remove(old);
        }
        (None, Some(dup)) => messages[dup] = replacement,
        (None, None) => messages.push(replacement),
    }
    sort(messages);
}
