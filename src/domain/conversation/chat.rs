//! Chat entity.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::{ChatId, Timestamp};

/// Longest derived title, in characters, before it is cut with an ellipsis.
const MAX_DERIVED_TITLE_CHARS: usize = 40;

const UNTITLED: &str = "New chat";

/// A conversation thread.
///
/// The id and creation time never change; `updated_at` moves forward every
/// time a message is inserted into the chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Chat {
    /// Creates a new chat with a fresh id.
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(ChatId::new(), title)
    }

    /// Creates a chat for an id chosen by the caller.
    pub fn with_id(id: ChatId, title: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            title: normalize_title(title.into()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a chat whose title is derived from its first user message.
    pub fn for_first_message(id: ChatId, first_message: &str) -> Self {
        Self::with_id(id, Self::title_from_message(first_message))
    }

    /// Returns a copy with `updated_at` bumped to now.
    pub fn touched(&self) -> Self {
        Self {
            updated_at: Timestamp::now_not_before(self.updated_at),
            ..self.clone()
        }
    }

    /// Returns a renamed copy with `updated_at` bumped.
    pub fn renamed(&self, title: impl Into<String>) -> Self {
        Self {
            title: normalize_title(title.into()),
            ..self.touched()
        }
    }

    /// Derives a short title from message text: first non-empty line, trimmed,
    /// cut to a fixed number of characters.
    pub fn title_from_message(text: &str) -> String {
        let line = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("");

        if line.chars().count() > MAX_DERIVED_TITLE_CHARS {
            let cut: String = line.chars().take(MAX_DERIVED_TITLE_CHARS).collect();
            format!("{}…", cut.trim_end())
        } else {
            normalize_title(line.to_string())
        }
    }
}

fn normalize_title(title: String) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        UNTITLED.to_string()
    } else {
        trimmed.to_string()
    }
}
