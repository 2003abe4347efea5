//! Chat API Traits
//!
//! The remote surface the store and the stream controller talk to. The HTTP
//! implementation lives in [`super::http`]; tests substitute a scripted mock.
//!
//! # Design Philosophy
//!
//! The trait exposes raw byte chunks for the streaming endpoint rather than
//! parsed frames. Frame decoding belongs to [`crate::streaming`], which must
//! see the response exactly as it arrived to honour its split-invariance
//! guarantees.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::wire::{MessagePage, RemoteConversation, SendRequest};
use crate::conversation::ConversationId;
use crate::error::TransportError;
use crate::messages::{Attachment, MessageId};

/// Raw body chunks of a streaming response
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Page request parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u32,
    /// Page size
    pub limit: u32,
}

impl PageRequest {
    /// Create a page request
    #[must_use]
    pub fn new(page: u32, limit: u32) -> Self {
        Self { page, limit }
    }
}

/// Remote conversation/message API
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Create a conversation
    async fn create_conversation(&self, title: &str) -> Result<RemoteConversation, TransportError>;

    /// Fetch a conversation's metadata
    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<RemoteConversation, TransportError>;

    /// Rename a conversation
    async fn update_conversation_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<(), TransportError>;

    /// Delete a conversation remotely
    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), TransportError>;

    /// Fetch one page of messages
    async fn get_messages(
        &self,
        id: &ConversationId,
        page: PageRequest,
    ) -> Result<MessagePage, TransportError>;

    /// Delete one message
    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;

    /// Toggle research mode
    async fn set_research_mode(
        &self,
        id: &ConversationId,
        enabled: bool,
    ) -> Result<(), TransportError>;

    /// Open the streaming send endpoint
    ///
    /// Resolves once response headers arrive. A non-success status is an
    /// error here; the body is only streamed on success.
    async fn open_stream(&self, request: &SendRequest) -> Result<ByteStream, TransportError>;

    /// Upload a file, returning its attachment record
    async fn upload_attachment(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment, TransportError>;
}
