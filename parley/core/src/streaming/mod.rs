//! Streaming Transport
//!
//! Turns one long-lived event-stream response into typed callbacks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        StreamController                          │
//! │                                                                  │
//! │   ChatApi::open_stream ──► bytes ──► StreamBuffer (full text)    │
//! │                                            │                     │
//! │                                            ▼                     │
//! │                                      FrameDecoder                │
//! │                               (processed offset, shape           │
//! │                                matchers, final sweep)            │
//! │                                            │                     │
//! │                                            ▼                     │
//! │   SessionTimer ──► timeout      dedup set + state gate           │
//! │   CancelHandle ──► cancel                  │                     │
//! │                                            ▼                     │
//! │                                     StreamCallbacks              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Split invariance**: frames decode identically however the body is
//!   chunked by the network
//! - **Shape normalisation**: historical payload shapes never leak past the
//!   decoder
//! - **At-most-once callbacks**: duplicate frames are dropped and terminal
//!   callbacks fire exactly once
//! - **Synchronous cancel**: usable before the connection is established

pub mod decoder;
pub mod event;
pub mod session;
pub mod timer;

pub use decoder::{final_sweep, DecodedFrame, FrameDecoder, StreamBuffer};
pub use event::{normalize, ChunkPayload, EventType, StreamEvent};
pub use session::{
    CancelHandle, SessionState, StreamCallbacks, StreamConfig, StreamController,
};
pub use timer::SessionTimer;
