//! In-memory conversation store.
//!
//! Keeps chats and messages in `RwLock`-guarded maps. Used by tests and by
//! clients that do not need durability. Failure injection lets tests
//! exercise storage-error paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::MessageFeedRegistry;
use crate::domain::conversation::{Chat, Message};
use crate::domain::foundation::{ChatId, MessageId};
use crate::ports::{ConversationStore, MessageFeed, StoreError};

#[derive(Debug, Default)]
struct Tables {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<MessageId, StoredMessage>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message: Message,
}

impl Tables {
    fn ordered_messages(&self, chat_id: &ChatId) -> Vec<Message> {
        let mut rows: Vec<&StoredMessage> = self
            .messages
            .values()
            .filter(|row| row.message.chat_id == *chat_id)
            .collect();
        rows.sort_by(|a, b| {
            a.message
                .timestamp
                .cmp(&b.message.timestamp)
                .then(a.seq.cmp(&b.seq))
        });
        rows.into_iter().map(|row| row.message.clone()).collect()
    }

    fn put_message(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(message.id, StoredMessage { seq, message });
    }
}

/// In-memory implementation of [`ConversationStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryConversationStore {
    tables: Arc<RwLock<Tables>>,
    feeds: Arc<MessageFeedRegistry>,
    fail_writes: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    message_writes: Arc<AtomicU64>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `StoreError::Database`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent read fail with `StoreError::Database`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of successful message inserts and updates so far.
    pub fn message_writes(&self) -> u64 {
        self.message_writes.load(Ordering::SeqCst)
    }

    /// Total number of stored messages across all chats.
    pub async fn message_count(&self) -> usize {
        self.tables.read().await.messages.len()
    }

    /// Removes everything (useful for tests).
    pub async fn clear(&self) {
        let mut tables = self.tables.write().await;
        *tables = Tables::default();
        for chat_id in self.feeds.watched_chats().await {
            self.feeds.publish(chat_id, Vec::new()).await;
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::database("writes disabled"));
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::database("reads disabled"));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, StoreError> {
        self.check_readable()?;
        Ok(self.tables.read().await.chats.get(id).cloned())
    }

    async fn insert_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.chats.insert(chat.id, chat.clone());
        Ok(())
    }

    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        match tables.chats.get_mut(&chat.id) {
            Some(existing) => {
                *existing = chat.clone();
                Ok(())
            }
            None => Err(StoreError::chat_not_found(&chat.id)),
        }
    }

    async fn delete_chat(&self, id: &ChatId) -> Result<(), StoreError> {
        self.check_writable()?;
        self.tables.write().await.chats.remove(id);
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<Chat>, StoreError> {
        self.check_readable()?;
        let tables = self.tables.read().await;
        let mut chats: Vec<Chat> = tables.chats.values().cloned().collect();
        chats.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(chats)
    }

    async fn delete_all_chats(&self) -> Result<(), StoreError> {
        self.check_writable()?;
        self.clear().await;
        Ok(())
    }

    async fn subscribe_messages(&self, chat_id: &ChatId) -> Result<MessageFeed, StoreError> {
        self.check_readable()?;
        let tables = self.tables.read().await;
        let current = tables.ordered_messages(chat_id);
        Ok(self.feeds.subscribe(*chat_id, current).await)
    }

    async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, StoreError> {
        self.check_readable()?;
        Ok(self.tables.read().await.ordered_messages(chat_id))
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.put_message(message.clone());
        self.message_writes.fetch_add(1, Ordering::SeqCst);
        let list = tables.ordered_messages(&message.chat_id);
        self.feeds.publish(message.chat_id, list).await;
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        match tables.messages.get_mut(&message.id) {
            Some(row) => row.message = message.clone(),
            None => return Err(StoreError::message_not_found(&message.id)),
        }
        self.message_writes.fetch_add(1, Ordering::SeqCst);
        let list = tables.ordered_messages(&message.chat_id);
        self.feeds.publish(message.chat_id, list).await;
        Ok(())
    }

    async fn delete_messages_for_chat(&self, chat_id: &ChatId) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut tables = self.tables.write().await;
        tables.messages.retain(|_, row| row.message.chat_id != *chat_id);
        self.feeds.publish(*chat_id, Vec::new()).await;
        Ok(())
    }
}
