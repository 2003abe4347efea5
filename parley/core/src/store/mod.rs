//! Conversation Store
//!
//! The authoritative in-memory state of every conversation. UI actions,
//! stream callbacks and the background cache sweep all mutate it; each
//! mutation takes the state lock once, reads and writes the *current* state,
//! and releases it before any `.await`.
//!
//! # Architecture
//!
//! ```text
//!   UI action ──► ConversationStore ◄── SendReconciler ◄── StreamController
//!                   │        │                                  ▲
//!                   │        └──────── send_message ────────────┘
//!                   ▼
//!         ┌─────────────────┐   ┌──────────────────┐   ┌──────────────┐
//!         │   StoreState    │   │   MessageCache   │   │  Pagination  │
//!         │ (conversations, │   │ (TTL snapshots)  │   │   Manager    │
//!         │  tombstones)    │   └──────────────────┘   └──────────────┘
//!         └─────────────────┘
//!                   │
//!                   ▼
//!         broadcast::Sender<StoreEvent> ──► renderer
//! ```
//!
//! # Guarantees
//!
//! - Message ids are unique within a conversation and messages stay sorted
//!   by timestamp.
//! - Soft-deleted conversations ignore every message mutation.
//! - A streaming placeholder is swapped for its final message in one step.
//! - At most one reply streams at a time; switching conversations cancels
//!   the abandoned one and discards its placeholder.

pub mod cache;
pub mod merge;
mod pacing;
pub mod pagination;
mod reconcile;


use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use self::cache::MessageCache;
use self::merge::{upsert, Upsert};
use self::pagination::{PageCursor, PaginationManager};
use self::reconcile::SendReconciler;
use crate::config::ClientConfig;
use crate::conversation::{derive_title, Conversation, ConversationId};
use crate::error::{StoreError, TransportError};
use crate::messages::{Attachment, Message, MessageId, PromptType};
use crate::persist::PersistedState;
use crate::streaming::{CancelHandle, StreamController};
use crate::transport::{ChatApi, PageRequest, Pagination, SendRequest};

/// Capacity of the event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Configuration and Events
// ============================================================================

/// Store settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    /// Pause after the optimistic add before the stream opens
    pub settle_pause: Duration,
    /// Maximum length of derived titles, in characters
    pub title_max_chars: usize,
    /// Title of conversations nobody has named yet
    pub default_title: String,
    /// Longest message accepted for sending, in characters
    pub max_input_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            settle_pause: Duration::from_millis(50),
            title_max_chars: 30,
            default_title: "New Chat".to_string(),
            max_input_length: 32768,
        }
    }
}

/// Notifications for the rendering layer
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// Messages or metadata of one conversation changed
    Changed {
        /// Affected conversation
        conversation_id: ConversationId,
    },
    /// A conversation was created, restored or deleted
    ConversationsChanged,
    /// Something the user must be told about explicitly
    Alert(String),
    /// A send failed; the input should be handed back to the user
    SendFailed {
        /// Conversation the send targeted
        conversation_id: ConversationId,
        /// Text the user typed
        text: String,
        /// Attachments the user picked
        attachments: Vec<Attachment>,
    },
}

/// A send that was accepted and is now streaming
#[derive(Clone, Debug)]
pub struct SendTicket {
    /// Conversation the reply streams into
    pub conversation_id: ConversationId,
    /// Session handle
    pub handle: CancelHandle,
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Clone, Debug)]
struct FetchedPage {
    messages: Vec<Message>,
    pagination: Option<Pagination>,
    returned: usize,
}

type SharedFetch = Shared<BoxFuture<'static, Result<FetchedPage, TransportError>>>;
type SharedSelect = Shared<BoxFuture<'static, Result<Vec<Message>, StoreError>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MergeMode {
    FirstPage,
    Older,
}

#[derive(Debug, Default)]
struct StoreState {
    conversations: HashMap<ConversationId, Conversation>,
    soft_deleted: HashSet<ConversationId>,
    selected: Option<ConversationId>,
}

impl StoreState {
    fn is_deleted(&self, id: &ConversationId) -> bool {
        self.soft_deleted.contains(id)
            || self
                .conversations
                .get(id)
                .is_some_and(|c| c.is_soft_deleted)
    }

    fn live_mut(&mut self, id: &ConversationId) -> Option<&mut Conversation> {
        if self.soft_deleted.contains(id) {
            return None;
        }
        self.conversations
            .get_mut(id)
            .filter(|c| !c.is_soft_deleted)
    }
}

struct ActiveSend {
    handle: CancelHandle,
    reconciler: Arc<SendReconciler>,
}

pub(crate) struct StoreInner {
    api: Arc<dyn ChatApi>,
    config: StoreConfig,
    sweep_interval: Duration,
    state: Mutex<StoreState>,
    cache: MessageCache,
    pager: PaginationManager,
    controller: StreamController,
    persisted: PersistedState,
    events: broadcast::Sender<StoreEvent>,
    in_flight_fetches: Mutex<HashMap<(ConversationId, u32), SharedFetch>>,
    in_flight_selects: Mutex<HashMap<ConversationId, SharedSelect>>,
    active: Mutex<Option<ActiveSend>>,
}

// ============================================================================
// Conversation Store
// ============================================================================

/// Shared handle to the conversation state
///
/// Cloning is cheap; all clones see the same state.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConversationStore")
            .field("conversations", &state.conversations.len())
            .field("soft_deleted", &state.soft_deleted.len())
            .finish_non_exhaustive()
    }
}

impl ConversationStore {
    /// Create a store
    pub fn new(api: Arc<dyn ChatApi>, config: &ClientConfig, persisted: PersistedState) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let controller = StreamController::new(Arc::clone(&api), config.stream.clone());
        Self {
            inner: Arc::new(StoreInner {
                api,
                config: config.store.clone(),
                sweep_interval: config.cache.sweep_interval,
                state: Mutex::new(StoreState::default()),
                cache: MessageCache::new(config.cache.ttl),
                pager: PaginationManager::new(config.pagination.clone()),
                controller,
                persisted,
                events,
                in_flight_fetches: Mutex::new(HashMap::new()),
                in_flight_selects: Mutex::new(HashMap::new()),
                active: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    /// Store settings
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Receive change notifications
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        // No receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn changed(&self, id: &ConversationId) {
        self.inner.cache.invalidate(id);
        self.emit(StoreEvent::Changed {
            conversation_id: id.clone(),
        });
    }

    fn ensure_live(&self, id: &ConversationId) -> Result<(), StoreError> {
        if self.inner.state.lock().is_deleted(id) {
            Err(StoreError::ConversationDeleted(id.to_string()))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Read Accessors
    // ========================================================================

    /// Snapshot of one conversation
    #[must_use]
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.inner.state.lock().conversations.get(id).cloned()
    }

    /// Non-deleted conversations, most recently updated first
    #[must_use]
    pub fn conversations(&self) -> Vec<Conversation> {
        let state = self.inner.state.lock();
        let mut list: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| !state.is_deleted(&c.id))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    /// Messages of one conversation, oldest first
    #[must_use]
    pub fn messages(&self, id: &ConversationId) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .conversations
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// One message of one conversation
    #[must_use]
    pub fn message(&self, id: &ConversationId, message_id: &MessageId) -> Option<Message> {
        self.inner
            .state
            .lock()
            .conversations
            .get(id)
            .and_then(|c| c.message(message_id).cloned())
    }

    /// Pagination cursor of one conversation
    #[must_use]
    pub fn cursor(&self, id: &ConversationId) -> PageCursor {
        self.inner.pager.cursor(id)
    }

    /// Whether the conversation is tombstoned
    #[must_use]
    pub fn is_soft_deleted(&self, id: &ConversationId) -> bool {
        self.inner.state.lock().is_deleted(id)
    }

    /// Conversation last selected
    #[must_use]
    pub fn selected_conversation(&self) -> Option<ConversationId> {
        self.inner.state.lock().selected.clone()
    }

    /// Session of the reply currently streaming, if any
    #[must_use]
    pub fn active_session(&self) -> Option<CancelHandle> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|a| a.handle.clone())
            .filter(|h| !h.state().is_terminal())
    }

    /// Number of held messages that exist on the server
    fn persisted_count(&self, id: &ConversationId) -> usize {
        self.inner
            .state
            .lock()
            .conversations
            .get(id)
            .map_or(0, |c| c.messages.iter().filter(|m| !m.id.is_transient()).count())
    }

    // ========================================================================
    // Message Mutations
    // ========================================================================

    /// Append a message
    ///
    /// Ignored on soft-deleted conversations and for ids already present.
    /// Creates the conversation entry when it is not known yet. The first
    /// user text in a conversation still carrying the default title renames
    /// it, locally at once and remotely in the background.
    pub fn add_message(&self, id: &ConversationId, message: Message) -> bool {
        let renamed = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.is_deleted(id) {
                tracing::debug!(conversation_id = %id, "Ignoring add on deleted conversation");
                return false;
            }

            let config = &self.inner.config;
            let conversation = state
                .conversations
                .entry(id.clone())
                .or_insert_with(|| Conversation::new(id.clone(), config.default_title.clone()));
            if conversation.contains(&message.id) {
                return false;
            }

            let renamed = (message.is_user
                && !message.text.trim().is_empty()
                && conversation.title == config.default_title
                && !conversation.has_user_text())
            .then(|| derive_title(&message.text, config.title_max_chars, &config.default_title));
            if let Some(ref title) = renamed {
                conversation.title.clone_from(title);
            }

            conversation.messages.push(message);
            conversation.sort_messages();
            conversation.touch();
            renamed
        };

        self.changed(id);
        if let Some(title) = renamed {
            self.schedule_title_update(id.clone(), title);
        }
        true
    }

    /// Insert or update a message by id
    ///
    /// Empty incoming text never blanks existing text. An identical update
    /// is a no-op unless the message is streaming.
    pub fn update_message(&self, id: &ConversationId, message: Message) -> bool {
        let outcome = {
            let mut state = self.inner.state.lock();
            let Some(conversation) = state.live_mut(id) else {
                return false;
            };
            let outcome = upsert(&mut conversation.messages, message);
            if outcome.is_change() {
                conversation.touch();
            }
            outcome
        };

        if outcome == Upsert::Unchanged {
            return false;
        }
        self.changed(id);
        true
    }

    /// Remove a message locally
    pub fn remove_message(&self, id: &ConversationId, message_id: &MessageId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let Some(conversation) = state.live_mut(id) else {
                return false;
            };
            let before = conversation.messages.len();
            conversation.messages.retain(|m| &m.id != message_id);
            let removed = conversation.messages.len() < before;
            if removed {
                conversation.touch();
            }
            removed
        };

        if removed {
            self.changed(id);
        }
        removed
    }

    /// Swap `old_id` for `replacement` in one step
    pub(crate) fn replace_message(
        &self,
        id: &ConversationId,
        old_id: &MessageId,
        replacement: Message,
    ) -> bool {
        {
            let mut state = self.inner.state.lock();
            let Some(conversation) = state.live_mut(id) else {
                return false;
            };
            merge::replace(&mut conversation.messages, old_id, replacement);
            conversation.touch();
        }
        self.changed(id);
        true
    }

    /// Delete a message, optimistically
    ///
    /// The message disappears at once. Locally minted messages never reach
    /// the server. If the remote delete fails, only the removed message is
    /// re-inserted into the current state, in timestamp order, so messages
    /// added or edited while the request was in flight are kept. The cache
    /// entry is restored from its snapshot taken before the delete.
    ///
    /// # Errors
    ///
    /// Returns the transport error after rolling back.
    pub async fn delete_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<(), StoreError> {
        let cache_snapshot = self.inner.cache.entry(id);
        let removed = {
            let mut state = self.inner.state.lock();
            let Some(conversation) = state.live_mut(id) else {
                tracing::debug!(conversation_id = %id, "Ignoring delete on deleted conversation");
                return Ok(());
            };
            let Some(index) = conversation.position(message_id) else {
                return Ok(());
            };
            let removed = conversation.messages.remove(index);
            conversation.touch();
            removed
        };
        self.changed(id);

        if message_id.is_transient() || id.is_local() {
            return Ok(());
        }

        if let Err(err) = self.inner.api.delete_message(id, message_id).await {
            tracing::warn!(
                conversation_id = %id,
                message_id = %message_id,
                error = %err,
                "Message delete failed, rolling back"
            );
            {
                let mut state = self.inner.state.lock();
                if let Some(conversation) = state.live_mut(id) {
                    if !conversation.contains(message_id) {
                        conversation.messages.push(removed);
                        conversation.sort_messages();
                    }
                }
            }
            self.emit(StoreEvent::Changed {
                conversation_id: id.clone(),
            });
            self.inner.cache.restore(id.clone(), cache_snapshot);
            return Err(err.into());
        }
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load one page of messages
    ///
    /// Page 1 is served from cache while the cache is fresh, unless
    /// `force_refresh`. Identical concurrent requests share one fetch.
    ///
    /// # Errors
    ///
    /// Fails for soft-deleted conversations and when the fetch fails.
    pub async fn load_messages(
        &self,
        id: &ConversationId,
        page: u32,
        limit: u32,
        force_refresh: bool,
    ) -> Result<Vec<Message>, StoreError> {
        self.ensure_live(id)?;
        let request = PageRequest::new(page.max(1), limit.max(1));

        if request.page == 1 && !force_refresh {
            if let Some(cached) = self.inner.cache.get(id) {
                tracing::debug!(conversation_id = %id, "Serving first page from cache");
                let page = FetchedPage {
                    returned: cached.len(),
                    messages: cached,
                    pagination: None,
                };
                return self.apply_page(id, request, page, MergeMode::FirstPage, false);
            }
        }

        let fetched = self.fetch_page(id, request).await?;
        let mode = if request.page == 1 {
            MergeMode::FirstPage
        } else {
            MergeMode::Older
        };
        self.apply_page(id, request, fetched, mode, true)
    }

    /// Load the next older page using the growing page limit
    ///
    /// Returns `false` without fetching once history is exhausted.
    ///
    /// # Errors
    ///
    /// Fails for soft-deleted conversations and when the fetch fails.
    pub async fn load_more(&self, id: &ConversationId) -> Result<bool, StoreError> {
        self.ensure_live(id)?;
        let loaded = self.persisted_count(id);
        let Some(request) = self.inner.pager.next_request(id, loaded) else {
            tracing::debug!(conversation_id = %id, "No older messages to load");
            return Ok(false);
        };

        let fetched = self.fetch_page(id, request).await?;
        self.apply_page(id, request, fetched, MergeMode::Older, true)?;
        Ok(true)
    }

    /// Re-enable pagination after history was exhausted
    pub fn reset_pagination(&self, id: &ConversationId) {
        self.inner.pager.reset(id);
    }

    async fn fetch_page(
        &self,
        id: &ConversationId,
        request: PageRequest,
    ) -> Result<FetchedPage, StoreError> {
        let key = (id.clone(), request.page);
        let fetch = {
            let mut in_flight = self.inner.in_flight_fetches.lock();
            if let Some(existing) = in_flight.get(&key) {
                tracing::debug!(conversation_id = %id, page = request.page, "Joining in-flight fetch");
                existing.clone()
            } else {
                let delay = self.inner.pager.reserve_fetch_slot(id);
                let api = Arc::clone(&self.inner.api);
                let conversation_id = id.clone();
                let future: BoxFuture<'static, Result<FetchedPage, TransportError>> = async move {
                    pacing::wait_for_fetch_slot(delay).await;
                    let page = api.get_messages(&conversation_id, request).await?;
                    let returned = page.messages.len();
                    let messages = page
                        .messages
                        .into_iter()
                        .filter_map(merge::accept_fetched)
                        .collect();
                    Ok(FetchedPage {
                        messages,
                        pagination: page.pagination,
                        returned,
                    })
                }
                .boxed();
                let shared = future.shared();
                in_flight.insert(key.clone(), shared.clone());
                shared
            }
        };

        let result = fetch.clone().await;
        {
            let mut in_flight = self.inner.in_flight_fetches.lock();
            if in_flight.get(&key).is_some_and(|f| f.ptr_eq(&fetch)) {
                in_flight.remove(&key);
            }
        }

        result.map_err(|err| {
            tracing::warn!(conversation_id = %id, page = request.page, error = %err, "Message fetch failed");
            StoreError::from(err)
        })
    }

    fn apply_page(
        &self,
        id: &ConversationId,
        request: PageRequest,
        page: FetchedPage,
        mode: MergeMode,
        from_network: bool,
    ) -> Result<Vec<Message>, StoreError> {
        let FetchedPage {
            messages: fetched,
            pagination,
            returned,
        } = page;

        let merged = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.is_deleted(id) {
                return Err(StoreError::ConversationDeleted(id.to_string()));
            }
            let default_title = &self.inner.config.default_title;
            let conversation = state
                .conversations
                .entry(id.clone())
                .or_insert_with(|| Conversation::new(id.clone(), default_title.clone()));

            conversation.messages = match mode {
                MergeMode::FirstPage => merge::merge_first_page(&conversation.messages, fetched),
                MergeMode::Older => merge::merge_older_page(&conversation.messages, fetched),
            };
            if let Some(total) = pagination.and_then(|p| p.total) {
                conversation.total_message_count = total;
            }
            conversation.messages.clone()
        };

        if from_network {
            self.inner.pager.record_page(id, request, returned, pagination);
            let snapshot = merged
                .iter()
                .filter(|m| !m.id.is_transient())
                .cloned()
                .collect();
            self.inner.cache.put(id.clone(), snapshot);
        }

        self.emit(StoreEvent::Changed {
            conversation_id: id.clone(),
        });
        Ok(merged)
    }

    /// Make `id` the current conversation, loading messages if needed
    ///
    /// Cancels a reply still streaming into a different conversation.
    /// Concurrent calls for the same id share the first call's work.
    /// Messages are fetched only when fewer are held than the server
    /// reports, or when the cache has gone stale.
    ///
    /// # Errors
    ///
    /// Fails for soft-deleted conversations and when a needed fetch fails.
    pub async fn select_conversation(&self, id: &ConversationId) -> Result<Vec<Message>, StoreError> {
        self.ensure_live(id)?;

        let switching_away = self
            .inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|a| a.handle.conversation_id() != id);
        if switching_away {
            self.cancel_stream();
        }
        self.inner.state.lock().selected = Some(id.clone());

        let select = {
            let mut in_flight = self.inner.in_flight_selects.lock();
            if let Some(existing) = in_flight.get(id) {
                existing.clone()
            } else {
                let store = self.clone();
                let conversation_id = id.clone();
                let shared = async move { store.load_if_needed(conversation_id).await }
                    .boxed()
                    .shared();
                in_flight.insert(id.clone(), shared.clone());
                shared
            }
        };

        let result = select.clone().await;
        {
            let mut in_flight = self.inner.in_flight_selects.lock();
            if in_flight.get(id).is_some_and(|f| f.ptr_eq(&select)) {
                in_flight.remove(id);
            }
        }
        result
    }

    async fn load_if_needed(self, id: ConversationId) -> Result<Vec<Message>, StoreError> {
        let known = self
            .conversation(&id)
            .map(|c| (c.messages.iter().filter(|m| !m.id.is_transient()).count(), c.total_message_count));

        let (held, total) = match known {
            Some(counts) => counts,
            None if id.is_local() => (0, 0),
            None => match self.inner.api.get_conversation(&id).await {
                Ok(remote) => {
                    let total = remote.message_count.unwrap_or(0);
                    if let Some(conversation) = remote.into_conversation(&self.inner.config.default_title) {
                        self.upsert_conversation(conversation);
                    }
                    (0, total)
                }
                Err(err) => {
                    tracing::warn!(conversation_id = %id, error = %err, "Conversation metadata fetch failed");
                    (0, 0)
                }
            },
        };

        let held_all = u32::try_from(held).unwrap_or(u32::MAX) >= total;
        if held_all && self.inner.cache.is_fresh(&id) {
            tracing::debug!(conversation_id = %id, "Conversation already loaded");
            return Ok(self.messages(&id));
        }

        let limit = self.inner.pager.config().initial_limit;
        self.load_messages(&id, 1, limit, false).await
    }

    // ========================================================================
    // Conversations
    // ========================================================================

    /// Insert or refresh conversation metadata, keeping held messages
    pub fn upsert_conversation(&self, conversation: Conversation) {
        {
            let mut state = self.inner.state.lock();
            if state.is_deleted(&conversation.id) {
                return;
            }
            match state.conversations.get_mut(&conversation.id) {
                Some(existing) => {
                    existing.title = conversation.title;
                    existing.is_research_mode = conversation.is_research_mode;
                    existing.total_message_count = conversation.total_message_count;
                    existing.updated_at = existing.updated_at.max(conversation.updated_at);
                }
                None => {
                    state
                        .conversations
                        .insert(conversation.id.clone(), conversation);
                }
            }
        }
        self.emit(StoreEvent::ConversationsChanged);
    }

    /// Create a conversation
    ///
    /// Falls back to a locally assigned id when the server cannot be
    /// reached, so the user is never blocked from typing.
    pub async fn create_conversation(&self, title: Option<&str>) -> Conversation {
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.inner.config.default_title)
            .to_string();

        let conversation = match self.inner.api.create_conversation(&title).await {
            Ok(remote) => remote.into_conversation(&title).unwrap_or_else(|| {
                tracing::warn!("Created conversation has no id, using a local id");
                Conversation::new(ConversationId::local(), title.clone())
            }),
            Err(err) => {
                tracing::warn!(error = %err, "Conversation creation failed, using a local id");
                Conversation::new(ConversationId::local(), title.clone())
            }
        };

        tracing::info!(conversation_id = %conversation.id, "Conversation created");
        self.upsert_conversation(conversation.clone());
        conversation
    }

    /// Tombstone a conversation locally
    ///
    /// Cancels a reply streaming into it and persists the tombstone list.
    /// The server copy is left alone.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the tombstone list cannot be saved;
    /// the conversation is tombstoned in memory regardless.
    pub async fn soft_delete_conversation(&self, id: &ConversationId) -> Result<(), StoreError> {
        let streaming_here = self
            .inner
            .active
            .lock()
            .as_ref()
            .is_some_and(|a| a.handle.conversation_id() == id);
        if streaming_here {
            self.cancel_stream();
        }

        let tombstones = {
            let mut state = self.inner.state.lock();
            state.soft_deleted.insert(id.clone());
            if let Some(conversation) = state.conversations.get_mut(id) {
                conversation.is_soft_deleted = true;
                conversation.touch();
            }
            if state.selected.as_ref() == Some(id) {
                state.selected = None;
            }
            let mut ids: Vec<String> = state.soft_deleted.iter().map(ToString::to_string).collect();
            ids.sort();
            ids
        };

        self.inner.cache.invalidate(id);
        self.inner.pager.remove(id);
        self.emit(StoreEvent::ConversationsChanged);
        tracing::info!(conversation_id = %id, "Conversation soft-deleted");

        self.inner
            .persisted
            .set_soft_deleted_conversations(&tombstones)
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "Failed to persist deleted conversations");
                StoreError::from(err)
            })
    }

    /// Read persisted tombstones; call once at startup
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the list cannot be read.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let ids = self.inner.persisted.soft_deleted_conversations().await?;
        let count = ids.len();
        {
            let mut state = self.inner.state.lock();
            for id in ids {
                let id = ConversationId::new(id);
                if let Some(conversation) = state.conversations.get_mut(&id) {
                    conversation.is_soft_deleted = true;
                }
                state.soft_deleted.insert(id);
            }
        }
        if count > 0 {
            tracing::info!(count, "Restored deleted conversations");
            self.emit(StoreEvent::ConversationsChanged);
        }
        Ok(count)
    }

    /// Toggle research mode, rolling back if the server refuses
    ///
    /// # Errors
    ///
    /// Fails for deleted or unknown conversations and when the remote update
    /// fails.
    pub async fn set_research_mode(&self, id: &ConversationId, enabled: bool) -> Result<(), StoreError> {
        let previous = {
            let mut state = self.inner.state.lock();
            if state.is_deleted(id) {
                return Err(StoreError::ConversationDeleted(id.to_string()));
            }
            let Some(conversation) = state.conversations.get_mut(id) else {
                return Err(StoreError::ConversationNotFound(id.to_string()));
            };
            let previous = conversation.is_research_mode;
            conversation.is_research_mode = enabled;
            previous
        };
        if previous == enabled {
            return Ok(());
        }
        self.emit(StoreEvent::Changed {
            conversation_id: id.clone(),
        });

        if id.is_local() {
            return Ok(());
        }
        if let Err(err) = self.inner.api.set_research_mode(id, enabled).await {
            tracing::warn!(conversation_id = %id, error = %err, "Research mode update failed, rolling back");
            {
                let mut state = self.inner.state.lock();
                if let Some(conversation) = state.live_mut(id) {
                    conversation.is_research_mode = previous;
                }
            }
            self.emit(StoreEvent::Changed {
                conversation_id: id.clone(),
            });
            return Err(err.into());
        }
        Ok(())
    }

    fn schedule_title_update(&self, id: ConversationId, title: String) {
        if id.is_local() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(conversation_id = %id, "No runtime, skipping remote title update");
            return;
        };
        let api = Arc::clone(&self.inner.api);
        runtime.spawn(async move {
            if let Err(err) = api.update_conversation_title(&id, &title).await {
                tracing::warn!(conversation_id = %id, error = %err, "Title update failed");
            }
        });
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn validate_input(&self, text: &str, attachments: &[Attachment]) -> Result<(), StoreError> {
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(StoreError::Validation("Message cannot be empty".to_string()));
        }
        let max = self.inner.config.max_input_length;
        if text.chars().count() > max {
            return Err(StoreError::Validation(format!(
                "Message is too long (maximum {max} characters)"
            )));
        }
        Ok(())
    }

    /// Send a message and stream the reply into the conversation
    ///
    /// Without a conversation id a new conversation is created first. The
    /// user message appears at once under a `temp_` id and is swapped for
    /// the server copy when the echo arrives. Any reply still streaming is
    /// cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] (also published as an alert) for
    /// empty or oversized input, and [`StoreError::ConversationDeleted`] for
    /// tombstoned targets. Stream failures are reported through
    /// [`StoreEvent::SendFailed`], not here.
    pub async fn send_message(
        &self,
        conversation_id: Option<ConversationId>,
        text: &str,
        attachments: Vec<Attachment>,
        prompt_type: PromptType,
    ) -> Result<SendTicket, StoreError> {
        if let Err(err) = self.validate_input(text, &attachments) {
            self.emit(StoreEvent::Alert(err.to_string()));
            return Err(err);
        }
        let text = text.trim();

        let conversation_id = match conversation_id {
            Some(id) => {
                self.ensure_live(&id)?;
                id
            }
            None => self.create_conversation(None).await.id,
        };

        self.cancel_stream();

        let optimistic = Message::user(text, attachments.clone());
        let optimistic_id = optimistic.id.clone();
        if !self.add_message(&conversation_id, optimistic) {
            return Err(StoreError::ConversationDeleted(conversation_id.to_string()));
        }

        pacing::settle(self.inner.config.settle_pause).await;
        self.ensure_live(&conversation_id)?;

        let research = self
            .conversation(&conversation_id)
            .is_some_and(|c| c.is_research_mode);
        let prompt_type = match prompt_type {
            PromptType::Default if research => PromptType::Research,
            other => other,
        };

        let request = SendRequest::new(conversation_id.clone(), text, attachments.clone(), prompt_type);
        let reconciler = Arc::new(SendReconciler::new(
            self.downgrade(),
            conversation_id.clone(),
            optimistic_id,
            text.to_string(),
            attachments,
        ));
        let handle = self.inner.controller.send(request, reconciler.clone());
        *self.inner.active.lock() = Some(ActiveSend {
            handle: handle.clone(),
            reconciler,
        });

        Ok(SendTicket {
            conversation_id,
            handle,
        })
    }

    /// Cancel the streaming reply, discarding its placeholder
    ///
    /// Returns whether a live session was cancelled. Silent: no error or
    /// failure event is published.
    pub fn cancel_stream(&self) -> bool {
        let active = self.inner.active.lock().take();
        let Some(active) = active else {
            return false;
        };
        let was_live = !active.handle.state().is_terminal();
        active.handle.cancel();
        active.reconciler.discard_placeholder();
        was_live
    }

    /// Forget the active send if it belongs to `reconciler`
    pub(crate) fn finish_send(&self, reconciler: &SendReconciler) {
        let mut active = self.inner.active.lock();
        if active
            .as_ref()
            .is_some_and(|a| std::ptr::eq(Arc::as_ptr(&a.reconciler), reconciler))
        {
            *active = None;
        }
    }

    // ========================================================================
    // Background Work
    // ========================================================================

    /// Periodically evict expired cache entries
    ///
    /// The task stops on its own once every store handle is dropped.
    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        let weak = self.downgrade();
        let period = self.inner.sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = inner.cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired cache entries");
                }
            }
        })
    }
}
