//! Conversation store adapters.

mod feed_registry;
mod in_memory;
mod sqlite;

pub use feed_registry::MessageFeedRegistry;
pub use in_memory::InMemoryConversationStore;
pub use sqlite::SqliteConversationStore;
