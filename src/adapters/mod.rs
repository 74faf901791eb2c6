//! Adapters - Implementations of the port interfaces.
//!
//! - `store` - in-memory and SQLite conversation stores
//! - `transport` - HTTP/SSE model transport and a scripted fake

pub mod store;
pub mod transport;

pub use store::{InMemoryConversationStore, MessageFeedRegistry, SqliteConversationStore};
pub use transport::{
    delta_payload, HttpModelTransport, ScriptStep, ScriptedTransport, SseDecoder, StreamDriver,
};
