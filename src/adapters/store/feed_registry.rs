//! Per-chat message feed registry.
//!
//! Each chat that has at least one live subscriber owns a `watch` channel
//! holding its ordered message list. Stores publish the fresh list after
//! every mutation; chats nobody watches are dropped from the registry.

use std::collections::HashMap;

use tokio::sync::{watch, RwLock};

use crate::domain::conversation::Message;
use crate::domain::foundation::ChatId;
use crate::ports::MessageFeed;

/// Registry of message feeds keyed by chat.
#[derive(Debug, Default)]
pub struct MessageFeedRegistry {
    feeds: RwLock<HashMap<ChatId, watch::Sender<Vec<Message>>>>,
}

impl MessageFeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a feed for `chat_id` seeded with `current`.
    pub async fn subscribe(&self, chat_id: ChatId, current: Vec<Message>) -> MessageFeed {
        let mut feeds = self.feeds.write().await;
        let sender = feeds
            .entry(chat_id)
            .or_insert_with(|| watch::channel(Vec::new()).0);
        replace_if_changed(sender, current);
        let receiver = sender.subscribe();
        MessageFeed::new(chat_id, receiver)
    }

    /// Publishes a new ordered list for `chat_id`.
    ///
    /// Subscribers are only woken when the list actually differs.
    pub async fn publish(&self, chat_id: ChatId, messages: Vec<Message>) {
        let mut feeds = self.feeds.write().await;
        match feeds.get(&chat_id) {
            None => return,
            Some(sender) if sender.receiver_count() > 0 => {
                replace_if_changed(sender, messages);
                return;
            }
            Some(_) => {}
        }
        feeds.remove(&chat_id);
    }

    /// Returns true if anyone currently watches `chat_id`.
    pub async fn is_watched(&self, chat_id: &ChatId) -> bool {
        self.feeds
            .read()
            .await
            .get(chat_id)
            .map(|sender| sender.receiver_count() > 0)
            .unwrap_or(false)
    }

    /// Chats with a registered feed.
    pub async fn watched_chats(&self) -> Vec<ChatId> {
        self.feeds.read().await.keys().copied().collect()
    }
}

fn replace_if_changed(sender: &watch::Sender<Vec<Message>>, messages: Vec<Message>) {
    sender.send_if_modified(|current| {
        if *current == messages {
            false
        } else {
            *current = messages;
            true
        }
    });
}
