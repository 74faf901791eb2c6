//! Application layer - orchestrates the domain through the ports.
//!
//! - `StreamReconciler` - runs one exchange from user text to final reply
//! - `ConversationController` - observable per-conversation session
//! - `ChatLibrary` - chat list management

mod chat_library;
mod controller;
mod reconciler;

pub use chat_library::ChatLibrary;
pub use controller::{ChatStatus, ConversationController};
pub use reconciler::{
    Exchange, ExchangeHandle, ExchangeOutcome, ReconcileError, StreamReconciler,
};
