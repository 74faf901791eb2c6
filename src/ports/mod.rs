//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the engine and the outside world. Adapters implement these ports.
//!
//! - `ConversationStore` - durable chats and messages with live feeds
//! - `ModelTransport` - streaming and single-shot calls to the model API

mod conversation_store;
mod model_transport;

pub use conversation_store::{ConversationStore, MessageFeed, StoreError};
pub use model_transport::{
    ChatMessage, ChatRequest, ChatResponse, Connection, ConnectionHandle, Credential,
    ModelTransport, ResponseChoice, ResponseMessage, TokenUsage, TransportError, TransportEvent,
};
