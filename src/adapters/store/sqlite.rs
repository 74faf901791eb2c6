//! SQLite implementation of ConversationStore.
//!
//! Chats and messages live in two tables. Ids are stored as text and
//! timestamps as Unix milliseconds. The schema is created on connect.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::MessageFeedRegistry;
use crate::config::StoreConfig;
use crate::domain::conversation::{Chat, Message};
use crate::domain::foundation::{ChatId, MessageId, Timestamp};
use crate::ports::{ConversationStore, MessageFeed, StoreError};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS chats (
        id TEXT PRIMARY KEY NOT NULL,
        title TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY NOT NULL,
        chat_id TEXT NOT NULL,
        content TEXT NOT NULL,
        is_user INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        is_streaming INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_chat_time ON messages (chat_id, timestamp)",
];

/// SQLite-backed conversation store.
#[derive(Clone)]
pub struct SqliteConversationStore {
    pool: SqlitePool,
    feeds: Arc<MessageFeedRegistry>,
    // Serialises a message write with the feed publication that follows it.
    write_lock: Arc<Mutex<()>>,
}

impl SqliteConversationStore {
    /// Opens (creating if needed) the database described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|e| StoreError::database(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::database(format!("Failed to connect: {}", e)))?;

        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and makes sure the schema exists.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::database(format!("Failed to create schema: {}", e)))?;
        }

        Ok(Self {
            pool,
            feeds: Arc::new(MessageFeedRegistry::new()),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_id, content, is_user, timestamp, is_streaming
            FROM messages
            WHERE chat_id = ?1
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to load messages: {}", e)))?;

        rows.iter().map(row_to_message).collect()
    }

    /// Pushes the chat's current messages to its watchers.
    ///
    /// Runs after a committed write, so a failed reload is logged and the
    /// write still reports success. Watchers catch up on the next change.
    async fn publish(&self, chat_id: &ChatId) {
        if !self.feeds.is_watched(chat_id).await {
            return;
        }
        match self.fetch_messages(chat_id).await {
            Ok(messages) => self.feeds.publish(*chat_id, messages).await,
            Err(e) => {
                tracing::warn!(chat_id = %chat_id, error = %e, "Failed to refresh message feed");
            }
        }
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get_chat(&self, id: &ChatId) -> Result<Option<Chat>, StoreError> {
        let row = sqlx::query("SELECT id, title, created_at, updated_at FROM chats WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to load chat: {}", e)))?;

        row.as_ref().map(row_to_chat).transpose()
    }

    async fn insert_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chats (id, title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(chat.id.to_string())
        .bind(&chat.title)
        .bind(chat.created_at.as_unix_millis())
        .bind(chat.updated_at.as_unix_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to insert chat: {}", e)))?;

        Ok(())
    }

    async fn update_chat(&self, chat: &Chat) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE chats SET title = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(chat.id.to_string())
            .bind(&chat.title)
            .bind(chat.updated_at.as_unix_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to update chat: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::chat_not_found(&chat.id));
        }
        Ok(())
    }

    async fn delete_chat(&self, id: &ChatId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM chats WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete chat: {}", e)))?;
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<Chat>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, created_at, updated_at
            FROM chats
            ORDER BY updated_at DESC, created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to list chats: {}", e)))?;

        rows.iter().map(row_to_chat).collect()
    }

    async fn delete_all_chats(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await.map_err(|e| {
            StoreError::database(format!("Failed to start transaction: {}", e))
        })?;
        sqlx::query("DELETE FROM messages")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete messages: {}", e)))?;
        sqlx::query("DELETE FROM chats")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete chats: {}", e)))?;
        tx.commit().await.map_err(|e| {
            StoreError::database(format!("Failed to commit transaction: {}", e))
        })?;

        for chat_id in self.feeds.watched_chats().await {
            self.feeds.publish(chat_id, Vec::new()).await;
        }
        Ok(())
    }

    async fn subscribe_messages(&self, chat_id: &ChatId) -> Result<MessageFeed, StoreError> {
        let _guard = self.write_lock.lock().await;
        let current = self.fetch_messages(chat_id).await?;
        Ok(self.feeds.subscribe(*chat_id, current).await)
    }

    async fn get_messages(&self, chat_id: &ChatId) -> Result<Vec<Message>, StoreError> {
        self.fetch_messages(chat_id).await
    }

    async fn insert_message(&self, message: &Message) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO messages (id, chat_id, content, is_user, timestamp, is_streaming)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.chat_id.to_string())
        .bind(&message.content)
        .bind(message.is_user)
        .bind(message.timestamp.as_unix_millis())
        .bind(message.is_streaming)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to insert message: {}", e)))?;

        self.publish(&message.chat_id).await;
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?2, is_user = ?3, timestamp = ?4, is_streaming = ?5
            WHERE id = ?1
            "#,
        )
        .bind(message.id.to_string())
        .bind(&message.content)
        .bind(message.is_user)
        .bind(message.timestamp.as_unix_millis())
        .bind(message.is_streaming)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("Failed to update message: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::message_not_found(&message.id));
        }

        self.publish(&message.chat_id).await;
        Ok(())
    }

    async fn delete_messages_for_chat(&self, chat_id: &ChatId) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        sqlx::query("DELETE FROM messages WHERE chat_id = ?1")
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("Failed to delete messages: {}", e)))?;

        self.publish(chat_id).await;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// Row mapping
// ════════════════════════════════════════════════════════════════════════════════

fn row_to_chat(row: &SqliteRow) -> Result<Chat, StoreError> {
    Ok(Chat {
        id: parse_id(row, "id")?,
        title: column(row, "title")?,
        created_at: Timestamp::from_unix_millis(column(row, "created_at")?),
        updated_at: Timestamp::from_unix_millis(column(row, "updated_at")?),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
    Ok(Message {
        id: parse_id::<MessageId>(row, "id")?,
        chat_id: parse_id::<ChatId>(row, "chat_id")?,
        content: column(row, "content")?,
        is_user: column(row, "is_user")?,
        timestamp: Timestamp::from_unix_millis(column(row, "timestamp")?),
        is_streaming: column(row, "is_streaming")?,
    })
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::Serialization(format!("Column {}: {}", name, e)))
}

fn parse_id<T: FromStr>(row: &SqliteRow, name: &str) -> Result<T, StoreError> {
    let raw: String = column(row, name)?;
    raw.parse()
        .map_err(|_| StoreError::Serialization(format!("Invalid {} '{}'", name, raw)))
}
