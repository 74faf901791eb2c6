//! Domain layer containing business logic and domain types.
//!
//! # Module Organization
//!
//! - `foundation` - Shared domain primitives (IDs, timestamps, errors, state machines)
//! - `conversation` - Chats, messages and the exchange lifecycle
pub mod conversation;
pub mod foundation;
