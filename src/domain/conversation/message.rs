//! Message entity and sender roles.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{ChatId, MessageId, Timestamp};

/// Role of the message sender, as understood by the model API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Returns the wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A persisted chat message.
///
/// While `is_streaming` is true the message belongs to the exchange that
/// created it and only that exchange may rewrite it. Once it flips to false
/// the message is history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub content: String,
    pub is_user: bool,
    pub timestamp: Timestamp,
    pub is_streaming: bool,
}

impl Message {
    /// Creates a complete user message.
    pub fn user(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            chat_id,
            content: content.into(),
            is_user: true,
            timestamp: Timestamp::now(),
            is_streaming: false,
        }
    }

    /// Creates an empty assistant placeholder that is still streaming.
    ///
    /// Its timestamp is never earlier than `not_before`, so it sorts after
    /// the user message that triggered it.
    pub fn assistant_placeholder(chat_id: ChatId, not_before: Timestamp) -> Self {
        Self {
            id: MessageId::new(),
            chat_id,
            content: String::new(),
            is_user: false,
            timestamp: Timestamp::now_not_before(not_before),
            is_streaming: true,
        }
    }

    /// Creates a complete assistant message.
    pub fn assistant(chat_id: ChatId, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            chat_id,
            content: content.into(),
            is_user: false,
            timestamp: Timestamp::now(),
            is_streaming: false,
        }
    }

    /// Returns a copy carrying new cumulative content, streaming flag untouched.
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    /// Returns a finished copy: final content, no longer streaming.
    pub fn finalized(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_streaming: false,
            ..self.clone()
        }
    }

    /// Returns the API role for this message.
    pub fn role(&self) -> Role {
        if self.is_user {
            Role::User
        } else {
            Role::Assistant
        }
    }
}
