//! Parley Core - Headless Chat Client Core
//!
//! This crate holds everything a chat client needs below its UI: the
//! streaming transport that turns a server-sent event body into typed
//! callbacks, and the conversation store that reconciles optimistic local
//! state with what the server confirms. It can drive a mobile app, a
//! terminal client or run headless for testing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         UI / Renderer                            │
//! │        subscribes to StoreEvent, calls store operations          │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┼──────────────────────────────────┐
//! │                         PARLEY CORE                              │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                   ConversationStore                        │  │
//! │  │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐  │  │
//! │  │  │ MessageCache │  │  Pagination  │  │  PersistedState  │  │  │
//! │  │  │    (TTL)     │  │   Manager    │  │  (tombstones)    │  │  │
//! │  │  └──────────────┘  └──────────────┘  └──────────────────┘  │  │
//! │  └────────────────────────────┬───────────────────────────────┘  │
//! │                               │ StreamCallbacks                  │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │  StreamController ─► FrameDecoder ─► normalize ─► dedup    │  │
//! │  └────────────────────────────┬───────────────────────────────┘  │
//! │                               │ ChatApi                          │
//! │  ┌────────────────────────────┴───────────────────────────────┐  │
//! │  │                    HttpChatApi (reqwest)                   │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use parley_core::{load_config, ConversationStore, HttpChatApi, PersistedState, PromptType};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config()?;
//!     let api = Arc::new(HttpChatApi::from_config(&config.api)?);
//!     let store = ConversationStore::new(api, &config, PersistedState::in_memory());
//!
//!     let mut events = store.subscribe();
//!     let ticket = store
//!         .send_message(None, "Hello!", Vec::new(), PromptType::Default)
//!         .await?;
//!     ticket.handle.finished().await;
//!
//!     while let Ok(event) = events.try_recv() {
//!         // Re-render
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`streaming`]: Frame decoding, event normalization and session control
//! - [`store`]: Conversation state, cache, pagination and merge rules
//! - [`transport`]: The chat API trait, its HTTP implementation and wire types
//! - [`messages`]: Message and attachment types
//! - [`conversation`]: Conversation type and title derivation
//! - [`persist`]: Device-local key-value persistence
//! - [`config`]: TOML and environment configuration
//! - [`test_utils`]: Scripted API and recording callbacks for tests

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod conversation;
pub mod error;
pub mod messages;
pub mod persist;
pub mod store;
pub mod streaming;
pub mod test_utils;
pub mod transport;

// Re-exports for convenience
pub use conversation::{derive_title, Conversation, ConversationId};
pub use error::{PersistError, StoreError, StreamError, TimeoutPhase, TransportError};
pub use messages::{Attachment, Message, MessageId, PromptType};

// Streaming exports
pub use streaming::{
    CancelHandle, ChunkPayload, EventType, FrameDecoder, SessionState, StreamCallbacks,
    StreamConfig, StreamController, StreamEvent,
};

// Store exports
pub use store::cache::{CacheConfig, MessageCache};
pub use store::pagination::{PageCursor, PaginationConfig, PaginationManager};
pub use store::{ConversationStore, SendTicket, StoreConfig, StoreEvent};

// Transport exports
pub use transport::{ChatApi, HttpChatApi, PageRequest, SendRequest};

// Persistence exports
pub use persist::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, PersistedState};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ApiConfig, ClientConfig, ConfigError,
    ConfigOverrides, ConfigSource,
};
