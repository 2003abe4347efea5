//! Transport Layer
//!
//! Everything that crosses the network: the [`ChatApi`] trait, its HTTP
//! implementation and the JSON wire types.

pub mod http;
pub mod traits;
pub mod wire;

pub use http::HttpChatApi;
pub use traits::{ByteStream, ChatApi, PageRequest};
pub use wire::{
    parse_timestamp, ConversationEnvelope, MessagePage, Pagination, RemoteConversation,
    RemoteMessage, SendRequest,
};
