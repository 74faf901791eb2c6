//! Conversation store port.
//!
//! Durable keyed storage for chats and messages. The engine writes through
//! this port and the presentation layer reads through per-chat feeds that
//! re-emit the ordered message list after every change.
//!
//! # Ordering
//!
//! `get_messages` and every feed emission return messages sorted by
//! `timestamp` ascending, ties broken by insertion order.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::domain::conversation::{Chat, Message};
use crate::domain::foundation::{ChatId, DomainError, ErrorCode, MessageId};

/// Repository port for chats and their messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Finds a chat by id. Returns `None` if it does not exist.
    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, StoreError>;

    /// Inserts a chat, replacing any chat with the same id.
    async fn insert_chat(&self, chat: &Chat) -> Result<(), StoreError>;

    /// Updates an existing chat.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the chat does not exist
    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError>;

    /// Deletes a chat row. Messages are not touched; callers that want a
    /// full removal delete the messages first.
    async fn delete_chat(&self, id: &ChatId) -> Result<(), StoreError>;

    /// Lists all chats, most recently updated first.
    async fn list_chats(&self) -> Result<Vec<Chat>, StoreError>;

    /// Deletes every chat and every message.
    async fn delete_all_chats(&self) -> Result<(), StoreError>;

    /// Subscribes to the ordered message list of a chat.
    ///
    /// The feed starts with the current list and re-emits after every insert,
    /// update or delete touching that chat.
    async fn subscribe_messages(&self, chat_id: &ChatId) -> Result<MessageFeed, StoreError>;

    /// Returns the current ordered message list of a chat.
    async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, StoreError>;

    /// Inserts a message, replacing any message with the same id.
    async fn insert_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Replaces an existing message.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the message does not exist
    async fn update_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Deletes all messages of a chat.
    async fn delete_messages_for_chat(&self, chat_id: &ChatId) -> Result<(), StoreError>;
}

/// Live view of one chat's ordered messages.
#[derive(Debug, Clone)]
pub struct MessageFeed {
    chat_id: ChatId,
    receiver: watch::Receiver<Vec<Message>>,
}

impl MessageFeed {
    pub fn new(chat_id: ChatId, receiver: watch::Receiver<Vec<Message>>) -> Self {
        Self { chat_id, receiver }
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// Returns the latest emitted list.
    pub fn current(&self) -> Vec<Message> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next emission.
    ///
    /// Returns `None` once the store side of the feed is gone.
    pub async fn changed(&mut self) -> Option<Vec<Message>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}

/// Errors raised by store implementations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn chat_not_found(id: &ChatId) -> Self {
        StoreError::NotFound {
            entity: "chat",
            id: id.to_string(),
        }
    }

    pub fn message_not_found(id: &MessageId) -> Self {
        StoreError::NotFound {
            entity: "message",
            id: id.to_string(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        StoreError::Database(message.into())
    }
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound { entity: "chat", .. } => ErrorCode::ChatNotFound,
            StoreError::NotFound { .. } => ErrorCode::MessageNotFound,
            _ => ErrorCode::StorageFailed,
        };
        DomainError::new(code, err.to_string())
    }
}
