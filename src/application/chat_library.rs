//! Chat library: listing and housekeeping of chats.
//!
//! This is a presentation-facing surface, so store failures come back as
//! [`DomainError`]s carrying the chat id involved.

use std::sync::Arc;

use crate::domain::conversation::Chat;
use crate::domain::foundation::{ChatId, DomainError};
use crate::ports::{ConversationStore, StoreError};

/// Chat list management over a [`ConversationStore`].
#[derive(Clone)]
pub struct ChatLibrary {
    store: Arc<dyn ConversationStore>,
}

fn for_chat(id: ChatId) -> impl FnOnce(StoreError) -> DomainError {
    move |err| DomainError::from(err).with_detail("chat_id", id.to_string())
}

impl ChatLibrary {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Creates and stores an empty chat.
    pub async fn create_chat(&self, title: &str) -> Result<Chat, DomainError> {
        let chat = Chat::new(title);
        self.store
            .insert_chat(&chat)
            .await
            .map_err(for_chat(chat.id))?;
        tracing::info!(chat_id = %chat.id, "Chat created");
        Ok(chat)
    }

    pub async fn chat(&self, id: &ChatId) -> Result<Option<Chat>, DomainError> {
        self.store.get_chat(id).await.map_err(for_chat(*id))
    }

    /// All chats, most recently updated first.
    pub async fn list_chats(&self) -> Result<Vec<Chat>, DomainError> {
        Ok(self.store.list_chats().await?)
    }

    /// Renames a chat. Returns `None` if it does not exist.
    pub async fn rename_chat(&self, id: &ChatId, title: &str) -> Result<Option<Chat>, DomainError> {
        let Some(chat) = self.store.get_chat(id).await.map_err(for_chat(*id))? else {
            return Ok(None);
        };
        let renamed = chat.renamed(title);
        self.store
            .update_chat(&renamed)
            .await
            .map_err(for_chat(*id))?;
        Ok(Some(renamed))
    }

    /// Deletes a chat together with its messages.
    pub async fn delete_chat(&self, id: &ChatId) -> Result<(), DomainError> {
        self.store
            .delete_messages_for_chat(id)
            .await
            .map_err(for_chat(*id))?;
        self.store.delete_chat(id).await.map_err(for_chat(*id))?;
        tracing::info!(chat_id = %id, "Chat deleted");
        Ok(())
    }

    pub async fn delete_all_chats(&self) -> Result<(), DomainError> {
        self.store.delete_all_chats().await?;
        tracing::info!("All chats deleted");
        Ok(())
    }
}
