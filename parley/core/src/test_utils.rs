//! Test Utilities
//!
//! A scripted [`ChatApi`] and a recording [`StreamCallbacks`] for exercising
//! the streaming and store layers without a server.
//!
//! # Usage
//!
//! ```ignore
//! use parley_core::test_utils::MockChatApi;
//!
//! let api = Arc::new(MockChatApi::new());
//! let tx = api.script_stream();
//! tx.send(Ok(b"event: ai_complete\ndata: {\"fullContent\":\"Hi\"}\n\n".to_vec()))?;
//!
//! // After the test, verify what reached the "server"
//! assert_eq!(api.get_messages_calls(), 1);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};

use crate::conversation::ConversationId;
use crate::error::{StreamError, TransportError};
use crate::messages::{Attachment, Message, MessageId};
use crate::streaming::{ChunkPayload, StreamCallbacks};
use crate::transport::{
    ByteStream, ChatApi, MessagePage, PageRequest, Pagination, RemoteConversation, RemoteMessage,
    SendRequest,
};

/// Sender half of a scripted response body
pub type StreamScript = mpsc::UnboundedSender<Result<Vec<u8>, TransportError>>;

enum ScriptedStream {
    Body(mpsc::UnboundedReceiver<Result<Vec<u8>, TransportError>>),
    Fail(TransportError),
}

/// Operations that can be told to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `create_conversation`
    CreateConversation,
    /// `get_conversation`
    GetConversation,
    /// `get_messages`
    GetMessages,
    /// `delete_message`
    DeleteMessage,
    /// `set_research_mode`
    SetResearchMode,
}

/// Build a server message record
#[must_use]
pub fn remote_message(id: &str, text: &str, is_user: bool, timestamp: DateTime<Utc>) -> RemoteMessage {
    RemoteMessage {
        object_id: Some(id.to_string()),
        text: Some(text.to_string()),
        is_user: Some(is_user),
        timestamp: Some(serde_json::Value::from(timestamp.to_rfc3339())),
        ..RemoteMessage::default()
    }
}

// ============================================================================
// Mock API
// ============================================================================

/// In-memory [`ChatApi`] with scripted responses
pub struct MockChatApi {
    streams: Mutex<VecDeque<ScriptedStream>>,
    pages: Mutex<HashMap<(ConversationId, u32), MessagePage>>,
    conversations: Mutex<HashMap<ConversationId, RemoteConversation>>,
    failing: Mutex<HashSet<MockOp>>,
    fetch_hold: watch::Sender<bool>,
    get_messages_calls: AtomicUsize,
    delete_hold: watch::Sender<bool>,
    delete_calls: AtomicUsize,
    created: AtomicUsize,
    sent: Mutex<Vec<SendRequest>>,
    title_updates: Mutex<Vec<(ConversationId, String)>>,
    deleted_messages: Mutex<Vec<(ConversationId, MessageId)>>,
}

impl Default for MockChatApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChatApi {
    /// Mock with nothing scripted
    #[must_use]
    pub fn new() -> Self {
        let (fetch_hold, _) = watch::channel(false);
        let (delete_hold, _) = watch::channel(false);
        Self {
            streams: Mutex::new(VecDeque::new()),
            pages: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            fetch_hold,
            get_messages_calls: AtomicUsize::new(0),
            delete_hold,
            delete_calls: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            title_updates: Mutex::new(Vec::new()),
            deleted_messages: Mutex::new(Vec::new()),
        }
    }

    /// Queue a response body for the next `open_stream`
    ///
    /// Chunks sent on the returned channel arrive as body bytes; dropping it
    /// ends the body.
    pub fn script_stream(&self) -> StreamScript {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push_back(ScriptedStream::Body(rx));
        tx
    }

    /// Make the next `open_stream` fail
    pub fn fail_stream(&self, error: TransportError) {
        self.streams.lock().push_back(ScriptedStream::Fail(error));
    }

    /// Serve `page` for `(id, page_number)`
    pub fn set_page(&self, id: &ConversationId, page_number: u32, page: MessagePage) {
        self.pages.lock().insert((id.clone(), page_number), page);
    }

    /// Serve `messages` as `page_number` of `pages`
    pub fn set_messages(
        &self,
        id: &ConversationId,
        page_number: u32,
        pages: u32,
        messages: Vec<RemoteMessage>,
    ) {
        let total = u32::try_from(messages.len()).unwrap_or(u32::MAX).saturating_mul(pages);
        self.set_page(
            id,
            page_number,
            MessagePage {
                messages,
                pagination: Some(Pagination {
                    page: Some(page_number),
                    pages: Some(pages),
                    total: Some(total),
                }),
            },
        );
    }

    /// Register conversation metadata served by `get_conversation`
    pub fn set_conversation(&self, conversation: RemoteConversation) {
        if let Some(id) = conversation.conversation_id() {
            self.conversations.lock().insert(id, conversation);
        }
    }

    /// Make `op` fail (or succeed again)
    pub fn set_failing(&self, op: MockOp, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(op);
        } else {
            set.remove(&op);
        }
    }

    fn check(&self, op: MockOp) -> Result<(), TransportError> {
        if self.failing.lock().contains(&op) {
            Err(TransportError::Connection(format!("{op:?} unavailable")))
        } else {
            Ok(())
        }
    }

    /// Park every `get_messages` call until [`release_fetches`](Self::release_fetches)
    pub fn hold_fetches(&self) {
        self.fetch_hold.send_replace(true);
    }

    /// Let parked `get_messages` calls proceed
    pub fn release_fetches(&self) {
        self.fetch_hold.send_replace(false);
    }

    /// Number of `get_messages` calls so far
    pub fn get_messages_calls(&self) -> usize {
        self.get_messages_calls.load(Ordering::SeqCst)
    }

    /// Park every `delete_message` call until [`release_deletes`](Self::release_deletes)
    pub fn hold_deletes(&self) {
        self.delete_hold.send_replace(true);
    }

    /// Let parked `delete_message` calls proceed
    pub fn release_deletes(&self) {
        self.delete_hold.send_replace(false);
    }

    /// Number of `delete_message` calls so far, failed ones included
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Requests passed to `open_stream`
    pub fn sent(&self) -> Vec<SendRequest> {
        self.sent.lock().clone()
    }

    /// Remote title updates, in call order
    pub fn title_updates(&self) -> Vec<(ConversationId, String)> {
        self.title_updates.lock().clone()
    }

    /// Remote message deletions, in call order
    pub fn deleted_messages(&self) -> Vec<(ConversationId, MessageId)> {
        self.deleted_messages.lock().clone()
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn create_conversation(&self, title: &str) -> Result<RemoteConversation, TransportError> {
        self.check(MockOp::CreateConversation)?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let conversation = RemoteConversation {
            object_id: Some(format!("conv_{n}")),
            title: Some(title.to_string()),
            ..RemoteConversation::default()
        };
        self.set_conversation(conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<RemoteConversation, TransportError> {
        self.check(MockOp::GetConversation)?;
        self.conversations
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Http {
                status: 404,
                body: "conversation not found".to_string(),
            })
    }

    async fn update_conversation_title(
        &self,
        id: &ConversationId,
        title: &str,
    ) -> Result<(), TransportError> {
        self.title_updates.lock().push((id.clone(), title.to_string()));
        Ok(())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<(), TransportError> {
        self.conversations.lock().remove(id);
        Ok(())
    }

    async fn get_messages(
        &self,
        id: &ConversationId,
        page: PageRequest,
    ) -> Result<MessagePage, TransportError> {
        self.get_messages_calls.fetch_add(1, Ordering::SeqCst);
        let mut hold = self.fetch_hold.subscribe();
        // Sender lives in self, so this only ends once released
        let _ = hold.wait_for(|held| !*held).await;

        self.check(MockOp::GetMessages)?;
        Ok(self
            .pages
            .lock()
            .get(&(id.clone(), page.page))
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), TransportError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let mut hold = self.delete_hold.subscribe();
        let _ = hold.wait_for(|held| !*held).await;

        self.check(MockOp::DeleteMessage)?;
        self.deleted_messages
            .lock()
            .push((conversation_id.clone(), message_id.clone()));
        Ok(())
    }

    async fn set_research_mode(
        &self,
        _id: &ConversationId,
        _enabled: bool,
    ) -> Result<(), TransportError> {
        self.check(MockOp::SetResearchMode)
    }

    async fn open_stream(&self, request: &SendRequest) -> Result<ByteStream, TransportError> {
        self.sent.lock().push(request.clone());
        let script = self.streams.lock().pop_front();
        match script {
            Some(ScriptedStream::Body(rx)) => Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
            Some(ScriptedStream::Fail(error)) => Err(error),
            None => Err(TransportError::Connection("no scripted stream".to_string())),
        }
    }

    async fn upload_attachment(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Attachment, TransportError> {
        Ok(Attachment {
            url: format!("https://files.test/{filename}"),
            filename: filename.to_string(),
            size: bytes.len() as u64,
            mime_type: mime_type.to_string(),
        })
    }
}

// ============================================================================
// Recording Callbacks
// ============================================================================

/// One callback invocation, reduced to what tests compare
#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    /// `on_user_message` with the confirmed id
    UserMessage(MessageId),
    /// `on_ai_start`
    AiStart(Option<MessageId>),
    /// `on_ai_chunk` with the accumulated text
    Chunk(String),
    /// `on_complete` with the final text
    Complete(String),
    /// `on_error`
    Error(StreamError),
}

/// [`StreamCallbacks`] that records every invocation
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<Recorded>>,
    notify: Notify,
}

impl RecordingCallbacks {
    fn record(&self, event: Recorded) {
        self.events.lock().push(event);
        self.notify.notify_one();
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Wait until at least `count` invocations were recorded
    pub async fn wait_for_events(&self, count: usize) {
        while self.events.lock().len() < count {
            self.notify.notified().await;
        }
    }
}

impl StreamCallbacks for RecordingCallbacks {
    fn on_user_message(&self, message: Message) {
        self.record(Recorded::UserMessage(message.id));
    }

    fn on_ai_start(&self, message_id: Option<MessageId>) {
        self.record(Recorded::AiStart(message_id));
    }

    fn on_ai_chunk(&self, chunk: ChunkPayload) {
        self.record(Recorded::Chunk(chunk.full_content));
    }

    fn on_complete(&self, message: Message) {
        self.record(Recorded::Complete(message.text));
    }

    fn on_error(&self, error: StreamError) {
        self.record(Recorded::Error(error));
    }
}
