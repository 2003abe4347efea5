//! Stream Session Controller
//!
//! Owns the lifecycle of one streaming send: open the connection, police the
//! timers, decode frames, drop duplicates and hand typed events to the
//! caller's [`StreamCallbacks`].
//!
//! # States
//!
//! ```text
//!   Idle ──► Connecting ──► Streaming ──┬──► Completed
//!                │              │       ├──► Failed
//!                └──────────────┴───────┴──► Cancelled
//! ```
//!
//! Terminal states are sticky. Exactly one of `on_complete` / `on_error`
//! fires per session, and neither fires after a cancel.
//!
//! # Cancellation
//!
//! [`CancelHandle::cancel`] is synchronous and may be called before the
//! connection task has even been polled. Callbacks are dispatched while
//! holding the session gate, so once `cancel` returns no callback of that
//! session can run again, including from the end-of-stream sweep.
//! [`StreamCallbacks::on_cancelled`] runs inside `cancel` itself, whichever
//! clone of the handle was used.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{watch, Notify};

use super::decoder::{final_sweep, DecodedFrame, FrameDecoder, StreamBuffer};
use super::event::{ChunkPayload, StreamEvent};
use super::timer::SessionTimer;
use crate::conversation::ConversationId;
use crate::error::{StreamError, TimeoutPhase};
use crate::messages::{Message, MessageId};
use crate::transport::{ChatApi, SendRequest};

// ============================================================================
// Configuration
// ============================================================================

/// Streaming session settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Time allowed before the first body byte arrives
    pub first_byte_timeout: Duration,
    /// Time allowed between body bytes once streaming
    pub inactivity_timeout: Duration,
    /// Payload characters included in dedup keys
    pub dedup_prefix_chars: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            first_byte_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(180),
            dedup_prefix_chars: 150,
        }
    }
}

// ============================================================================
// Callbacks and State
// ============================================================================

/// Receiver of a session's events
///
/// Called from the connection task. Implementations must not block.
pub trait StreamCallbacks: Send + Sync {
    /// The server confirmed the user's message
    fn on_user_message(&self, message: Message);

    /// The assistant reply started
    fn on_ai_start(&self, message_id: Option<MessageId>);

    /// Cumulative reply text; replaces, never appends
    fn on_ai_chunk(&self, chunk: ChunkPayload);

    /// The reply finished
    fn on_complete(&self, message: Message);

    /// The session failed
    fn on_error(&self, error: StreamError);

    /// The session was cancelled; runs synchronously inside
    /// [`CancelHandle::cancel`]
    fn on_cancelled(&self) {}
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created, task not started
    Idle,
    /// Request sent, waiting for the first byte
    Connecting,
    /// Body bytes are arriving
    Streaming,
    /// Finished with a completion frame
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl SessionState {
    /// Whether the session has ended
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct SessionShared {
    id: u64,
    conversation_id: ConversationId,
    cancelled: AtomicBool,
    wake: Notify,
    /// Held while dispatching and while cancelling
    gate: ReentrantMutex<()>,
    state: watch::Sender<SessionState>,
    callbacks: Arc<dyn StreamCallbacks>,
}

impl SessionShared {
    /// Move to `to` unless already terminal
    fn transition(&self, to: SessionState) -> bool {
        let from = *self.state.borrow();
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                false
            } else {
                *state = to;
                true
            }
        });
        if changed {
            tracing::debug!(
                session_id = self.id,
                conversation_id = %self.conversation_id,
                from = %from,
                to = %to,
                "Stream session transition"
            );
        }
        changed
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// Handle to a running session
///
/// Cheap to clone; every clone controls the same session.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("session_id", &self.shared.id)
            .field("conversation_id", &self.shared.conversation_id)
            .field("state", &self.state())
            .finish()
    }
}

impl CancelHandle {
    fn new(conversation_id: ConversationId, callbacks: Arc<dyn StreamCallbacks>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(SessionShared {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                conversation_id,
                cancelled: AtomicBool::new(false),
                wake: Notify::new(),
                gate: ReentrantMutex::new(()),
                state,
                callbacks,
            }),
        }
    }

    /// Cancel the session
    ///
    /// Idempotent, and a no-op once the session has ended. Fires
    /// `on_cancelled` before returning; no other callback of this session
    /// fires afterwards.
    pub fn cancel(&self) {
        let _gate = self.shared.gate.lock();
        if self.shared.state().is_terminal() {
            return;
        }
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.transition(SessionState::Cancelled);
        self.shared.wake.notify_one();
        self.shared.callbacks.on_cancelled();

        tracing::info!(
            session_id = self.shared.id,
            conversation_id = %self.shared.conversation_id,
            "Stream session cancelled"
        );
    }

    /// Whether the session was cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Conversation the session belongs to
    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.shared.conversation_id
    }

    /// Process-unique session number
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.shared.id
    }

    /// Whether two handles refer to the same session
    #[must_use]
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Wait until the session reaches a terminal state
    pub async fn finished(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_or(SessionState::Cancelled, |state| *state)
    }

    /// Resolve once `cancel` has been called
    async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            self.shared.wake.notified().await;
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Starts streaming sessions, keeping at most one alive
pub struct StreamController {
    api: Arc<dyn ChatApi>,
    config: StreamConfig,
    live: Mutex<Option<CancelHandle>>,
}

impl StreamController {
    /// Create a controller
    pub fn new(api: Arc<dyn ChatApi>, config: StreamConfig) -> Self {
        Self {
            api,
            config,
            live: Mutex::new(None),
        }
    }

    /// Session settings in use
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Start a session for `request`
    ///
    /// Any session still live (for any conversation) is cancelled first.
    /// Must be called from within a tokio runtime.
    pub fn send(&self, request: SendRequest, callbacks: Arc<dyn StreamCallbacks>) -> CancelHandle {
        let handle = CancelHandle::new(request.conversation_id.clone(), Arc::clone(&callbacks));
        let previous = self.live.lock().replace(handle.clone());
        if let Some(previous) = previous {
            if !previous.state().is_terminal() {
                tracing::debug!(
                    session_id = previous.session_id(),
                    conversation_id = %previous.conversation_id(),
                    "Cancelling stale stream session"
                );
            }
            previous.cancel();
        }

        tracing::info!(
            session_id = handle.session_id(),
            conversation_id = %request.conversation_id,
            "Stream session starting"
        );

        handle.shared.transition(SessionState::Connecting);
        let session = Session::new(handle.clone(), callbacks, self.config.dedup_prefix_chars);
        tokio::spawn(run_session(
            Arc::clone(&self.api),
            request,
            session,
            self.config.clone(),
        ));
        handle
    }

    /// Handle of the live session, if one has not yet ended
    #[must_use]
    pub fn live_session(&self) -> Option<CancelHandle> {
        self.live
            .lock()
            .as_ref()
            .filter(|h| !h.state().is_terminal())
            .cloned()
    }

    /// Cancel the live session, if any
    pub fn cancel_live(&self) {
        let live = self.live.lock().take();
        if let Some(handle) = live {
            handle.cancel();
        }
    }
}

// ============================================================================
// Session Task
// ============================================================================

/// Why the read loop stopped
enum LoopEnd {
    Cancelled,
    Timeout(TimeoutPhase),
    Disconnected(String),
    Eof,
    Terminal,
}

/// Per-session dispatcher state
struct Session {
    handle: CancelHandle,
    callbacks: Arc<dyn StreamCallbacks>,
    seen: HashSet<String>,
    dedup_prefix_chars: usize,
    user_message_fired: bool,
    ai_start_fired: bool,
}

impl Session {
    fn new(handle: CancelHandle, callbacks: Arc<dyn StreamCallbacks>, dedup_prefix_chars: usize) -> Self {
        Self {
            handle,
            callbacks,
            seen: HashSet::new(),
            dedup_prefix_chars,
            user_message_fired: false,
            ai_start_fired: false,
        }
    }

    fn shared(&self) -> &SessionShared {
        &self.handle.shared
    }

    fn is_over(&self) -> bool {
        self.shared().is_cancelled() || self.shared().state().is_terminal()
    }

    /// Route one frame to its callback
    fn dispatch(&mut self, frame: DecodedFrame) {
        let shared = Arc::clone(&self.handle.shared);
        let _gate = shared.gate.lock();
        if self.is_over() {
            tracing::debug!(
                session_id = shared.id,
                event_type = %frame.event_type(),
                "Dropping frame after session end"
            );
            return;
        }

        let key = frame.dedup_key(self.dedup_prefix_chars);
        if !self.seen.insert(key) {
            tracing::debug!(
                session_id = shared.id,
                event_type = %frame.event_type(),
                "Dropping duplicate frame"
            );
            return;
        }

        match frame.event {
            StreamEvent::UserMessage(message) => {
                if std::mem::replace(&mut self.user_message_fired, true) {
                    return;
                }
                self.callbacks.on_user_message(message);
            }
            StreamEvent::AiStart { message_id } => {
                if std::mem::replace(&mut self.ai_start_fired, true) {
                    return;
                }
                self.callbacks.on_ai_start(message_id);
            }
            StreamEvent::ThinkingStep => {}
            StreamEvent::AiChunk(chunk) => self.callbacks.on_ai_chunk(chunk),
            StreamEvent::AiComplete(message) => {
                tracing::info!(
                    session_id = shared.id,
                    conversation_id = %shared.conversation_id,
                    message_id = %message.id,
                    "Stream session completed"
                );
                // Callback before transition so `finished()` observers see its effects
                self.callbacks.on_complete(message);
                shared.transition(SessionState::Completed);
            }
            event @ StreamEvent::Error { .. } => {
                if let Some(error) = event.to_stream_error() {
                    self.fail_locked(error);
                }
            }
        }
    }

    /// Fail the session unless it already ended
    fn fail(&mut self, error: StreamError) {
        let shared = Arc::clone(&self.handle.shared);
        let _gate = shared.gate.lock();
        if self.is_over() {
            return;
        }
        self.fail_locked(error);
    }

    fn fail_locked(&self, error: StreamError) {
        let shared = self.shared();
        if shared.state().is_terminal() {
            return;
        }
        tracing::warn!(
            session_id = shared.id,
            conversation_id = %shared.conversation_id,
            error = %error,
            "Stream session failed"
        );
        self.callbacks.on_error(error);
        shared.transition(SessionState::Failed);
    }
}

/// Drive one session from request to terminal state
async fn run_session(
    api: Arc<dyn ChatApi>,
    request: SendRequest,
    mut session: Session,
    config: StreamConfig,
) {
    let handle = session.handle.clone();
    let mut timer = SessionTimer::new();
    timer.arm(config.first_byte_timeout);

    let opened = tokio::select! {
        biased;
        () = handle.cancelled() => return,
        () = timer.fired() => Err(StreamError::Timeout { phase: TimeoutPhase::FirstByte }),
        result = api.open_stream(&request) => result.map_err(|e| StreamError::from_transport(&e)),
    };

    let mut body = match opened {
        Ok(body) => body,
        Err(error) => {
            timer.disarm();
            session.fail(error);
            return;
        }
    };

    let mut buffer = StreamBuffer::new();
    let mut decoder = FrameDecoder::new();
    let mut got_first_byte = false;

    let end = loop {
        tokio::select! {
            biased;
            () = handle.cancelled() => break LoopEnd::Cancelled,
            () = timer.fired() => {
                let phase = if got_first_byte { TimeoutPhase::Inactivity } else { TimeoutPhase::FirstByte };
                break LoopEnd::Timeout(phase);
            }
            chunk = body.next() => match chunk {
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    if !got_first_byte {
                        got_first_byte = true;
                        handle.shared.transition(SessionState::Streaming);
                    }
                    timer.arm(config.inactivity_timeout);
                    buffer.push(&bytes);
                    for frame in decoder.decode(buffer.text()) {
                        session.dispatch(frame);
                    }
                    if session.is_over() {
                        break LoopEnd::Terminal;
                    }
                }
                Some(Err(e)) => break LoopEnd::Disconnected(e.to_string()),
                None => break LoopEnd::Eof,
            },
        }
    };
    timer.disarm();
    drop(body);

    // The completion frame may never have been followed by a delimiter
    buffer.finish();
    if !session.is_over() {
        if let Some(frame) = final_sweep(buffer.text()) {
            tracing::debug!(
                session_id = handle.session_id(),
                "Completion recovered from end-of-stream sweep"
            );
            session.dispatch(frame);
        }
    }

    match end {
        LoopEnd::Cancelled | LoopEnd::Terminal => {}
        LoopEnd::Timeout(phase) => session.fail(StreamError::Timeout { phase }),
        LoopEnd::Disconnected(reason) => session.fail(StreamError::Connection(reason)),
        LoopEnd::Eof => session.fail(StreamError::Server {
            status: None,
            message: "stream ended without completion".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PromptType;
    use crate::test_utils::{MockChatApi, RecordingCallbacks, Recorded};
    use pretty_assertions::assert_eq;

    fn request() -> SendRequest {
        SendRequest::new(ConversationId::new("c1"), "Hello", Vec::new(), PromptType::Default)
    }

    fn frame(event: &str, data: &str) -> Vec<u8> {
        format!("event: {event}\ndata: {data}\n\n").into_bytes()
    }

    #[tokio::test]
    async fn test_full_session() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        tx.send(Ok(frame("ai_start", r#"{"messageId":"a1"}"#))).unwrap();
        tx.send(Ok(frame("ai_chunk", r#"{"messageId":"a1","content":"Hi","fullContent":"Hi"}"#)))
            .unwrap();
        tx.send(Ok(frame("ai_complete", r#"{"messageId":"a1","fullContent":"Hi"}"#)))
            .unwrap();

        assert_eq!(handle.finished().await, SessionState::Completed);
        assert_eq!(
            callbacks.events(),
            vec![
                Recorded::AiStart(Some(MessageId::new("a1"))),
                Recorded::Chunk("Hi".to_string()),
                Recorded::Complete("Hi".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_frame_fires_once() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        let chunk = frame("ai_chunk", r#"{"messageId":"a1","fullContent":"Hi"}"#);
        tx.send(Ok(chunk.clone())).unwrap();
        tx.send(Ok(chunk)).unwrap();
        tx.send(Ok(frame("ai_complete", r#"{"messageId":"a1","fullContent":"Hi"}"#)))
            .unwrap();

        handle.finished().await;
        let chunks = callbacks
            .events()
            .into_iter()
            .filter(|e| matches!(e, Recorded::Chunk(_)))
            .count();
        assert_eq!(chunks, 1);
    }

    #[tokio::test]
    async fn test_long_cumulative_chunks_all_delivered() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        let base = "a".repeat(200);
        let texts: Vec<String> = ["", "b", "bc"].iter().map(|s| format!("{base}{s}")).collect();
        for text in &texts {
            let data = format!(r#"{{"messageId":"a1","fullContent":"{text}"}}"#);
            tx.send(Ok(frame("ai_chunk", &data))).unwrap();
        }
        callbacks.wait_for_events(3).await;
        handle.cancel();

        let chunks: Vec<Recorded> = texts.into_iter().map(Recorded::Chunk).collect();
        assert_eq!(callbacks.events(), chunks);
    }

    #[derive(Default)]
    struct CancelCounter(std::sync::atomic::AtomicUsize);

    impl StreamCallbacks for CancelCounter {
        fn on_user_message(&self, _message: Message) {}
        fn on_ai_start(&self, _message_id: Option<MessageId>) {}
        fn on_ai_chunk(&self, _chunk: ChunkPayload) {}
        fn on_complete(&self, _message: Message) {}
        fn on_error(&self, _error: StreamError) {}
        fn on_cancelled(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_cancel_notifies_callbacks_once() {
        let api = Arc::new(MockChatApi::new());
        let _tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(CancelCounter::default());

        let handle = controller.send(request(), callbacks.clone());
        let copy = handle.clone();
        copy.cancel();
        assert_eq!(callbacks.0.load(Ordering::SeqCst), 1);

        handle.cancel();
        assert_eq!(handle.finished().await, SessionState::Cancelled);
        assert_eq!(callbacks.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_chunk_after_complete() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        let mut bytes = frame("ai_complete", r#"{"messageId":"a1","fullContent":"Done"}"#);
        bytes.extend(frame("ai_chunk", r#"{"messageId":"a1","fullContent":"Done and more"}"#));
        tx.send(Ok(bytes)).unwrap();

        assert_eq!(handle.finished().await, SessionState::Completed);
        assert_eq!(callbacks.events(), vec![Recorded::Complete("Done".to_string())]);
    }

    #[tokio::test]
    async fn test_completion_without_trailing_delimiter() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        tx.send(Ok(b"event: ai_complete\ndata: {\"fullContent\":\"Hi\"}".to_vec()))
            .unwrap();
        drop(tx);

        assert_eq!(handle.finished().await, SessionState::Completed);
        assert_eq!(callbacks.events(), vec![Recorded::Complete("Hi".to_string())]);
    }

    #[tokio::test]
    async fn test_eof_without_completion_fails() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        tx.send(Ok(frame("ai_chunk", r#"{"fullContent":"Hi"}"#))).unwrap();
        drop(tx);

        assert_eq!(handle.finished().await, SessionState::Failed);
        assert!(matches!(
            callbacks.events().last(),
            Some(Recorded::Error(StreamError::Server { status: None, .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_fires_nothing() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        handle.cancel();
        let _ = tx.send(Ok(frame("ai_complete", r#"{"fullContent":"Hi"}"#)));

        assert_eq!(handle.finished().await, SessionState::Cancelled);
        tokio::task::yield_now().await;
        assert!(callbacks.events().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_suppresses_sweep() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        tx.send(Ok(frame("ai_chunk", r#"{"fullContent":"Hi"}"#))).unwrap();
        callbacks.wait_for_events(1).await;

        handle.cancel();
        let _ = tx.send(Ok(b"event: ai_complete\ndata: {\"fullContent\":\"Hi\"}".to_vec()));
        drop(tx);

        assert_eq!(handle.finished().await, SessionState::Cancelled);
        tokio::task::yield_now().await;
        assert_eq!(callbacks.events(), vec![Recorded::Chunk("Hi".to_string())]);
    }

    #[tokio::test]
    async fn test_new_send_cancels_previous_session() {
        let api = Arc::new(MockChatApi::new());
        let _first_tx = api.script_stream();
        let _second_tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());

        let first = controller.send(request(), Arc::new(RecordingCallbacks::default()));
        let second = controller.send(
            SendRequest::new(ConversationId::new("c2"), "Hi", Vec::new(), PromptType::Default),
            Arc::new(RecordingCallbacks::default()),
        );

        assert_eq!(first.state(), SessionState::Cancelled);
        assert!(!second.state().is_terminal());
        assert!(controller
            .live_session()
            .is_some_and(|live| live.same_session(&second)));
    }

    #[tokio::test]
    async fn test_rate_limited_open_is_user_visible() {
        let api = Arc::new(MockChatApi::new());
        api.fail_stream(crate::error::TransportError::Http {
            status: 429,
            body: String::new(),
        });
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        assert_eq!(handle.finished().await, SessionState::Failed);

        let events = callbacks.events();
        let Some(Recorded::Error(error)) = events.last() else {
            panic!("expected an error, got {events:?}");
        };
        assert!(error.is_user_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_byte_timeout() {
        let api = Arc::new(MockChatApi::new());
        let _tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        assert_eq!(handle.finished().await, SessionState::Failed);
        assert_eq!(
            callbacks.events(),
            vec![Recorded::Error(StreamError::Timeout {
                phase: TimeoutPhase::FirstByte
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_timeout_after_first_byte() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        tx.send(Ok(frame("ai_start", "{}"))).unwrap();

        assert_eq!(handle.finished().await, SessionState::Failed);
        assert_eq!(
            callbacks.events().last(),
            Some(&Recorded::Error(StreamError::Timeout {
                phase: TimeoutPhase::Inactivity
            }))
        );
    }

    #[tokio::test]
    async fn test_mis_tagged_success_is_user_message() {
        let api = Arc::new(MockChatApi::new());
        let tx = api.script_stream();
        let controller = StreamController::new(api.clone(), StreamConfig::default());
        let callbacks = Arc::new(RecordingCallbacks::default());

        let handle = controller.send(request(), callbacks.clone());
        tx.send(Ok(frame(
            "error",
            r#"{"success":true,"userMessage":{"_id":"u1","text":"Hello"}}"#,
        )))
        .unwrap();
        tx.send(Ok(frame("ai_complete", r#"{"fullContent":"Hi"}"#))).unwrap();

        assert_eq!(handle.finished().await, SessionState::Completed);
        assert_eq!(
            callbacks.events(),
            vec![
                Recorded::UserMessage(MessageId::new("u1")),
                Recorded::Complete("Hi".to_string()),
            ]
        );
    }
}
