//! Conversation module - chats, messages and the exchange lifecycle.
//!
//! An exchange is one user turn: the user message, the assistant placeholder
//! that is filled in while the model streams, and the buffer that accumulates
//! the streamed fragments.

mod chat;
mod exchange_state;
mod frame;
mod message;
mod response_buffer;

pub use chat::Chat;
pub use exchange_state::ExchangeState;
pub use frame::{StreamFrame, DONE_SENTINEL};
pub use message::{Message, Role};
pub use response_buffer::ResponseBuffer;
