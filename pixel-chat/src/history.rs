//! Bounded, append-only log of recent messages.
//!
//! Insertion order is send order as observed by the callers; once the log
//! exceeds its cap the oldest entries are evicted first.

use std::collections::VecDeque;

use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::ChatError;
use crate::protocol::{Message, MessageKind};

/// Author id of server-generated messages.
pub const SYSTEM_AUTHOR_ID: &str = "system";
/// Author name of server-generated messages.
pub const SYSTEM_AUTHOR_NAME: &str = "SYSTEM";

/// Author fields copied onto a message.
#[derive(Debug, Clone, Copy)]
pub struct Author<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub avatar: &'a str,
}

/// Concurrency-safe recent-message log.
pub struct HistoryStore {
    messages: RwLock<VecDeque<Message>>,
    max_history: usize,
    max_length: usize,
}

impl HistoryStore {
    /// `max_history` caps the number of retained messages, `max_length`
    /// the number of characters in a user message body.
    pub fn new(max_history: usize, max_length: usize) -> Self {
        Self {
            messages: RwLock::new(VecDeque::with_capacity(max_history.min(1024))),
            max_history,
            max_length,
        }
    }

    /// Append a user message after validating its body.
    pub async fn append(
        &self,
        author: Author<'_>,
        body: impl Into<String>,
        kind: MessageKind,
    ) -> Result<Message, ChatError> {
        let body = body.into();
        if body.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if body.chars().count() > self.max_length {
            return Err(ChatError::MessageTooLong { max: self.max_length });
        }

        Ok(self.push(author, body, kind).await)
    }

    /// Append trusted server text. Never fails.
    pub async fn append_system(&self, body: impl Into<String>) -> Message {
        let author = Author {
            id: SYSTEM_AUTHOR_ID,
            name: SYSTEM_AUTHOR_NAME,
            avatar: "",
        };
        self.push(author, body.into(), MessageKind::System).await
    }

    async fn push(&self, author: Author<'_>, body: String, kind: MessageKind) -> Message {
        let message = Message {
            id: Uuid::new_v4(),
            author_id: author.id.to_string(),
            author_name: author.name.to_string(),
            author_avatar: author.avatar.to_string(),
            body,
            at: Utc::now(),
            kind,
        };

        let mut messages = self.messages.write().await;
        messages.push_back(message.clone());
        while messages.len() > self.max_history {
            messages.pop_front();
        }
        message
    }

    /// The last `min(limit, len)` messages in send order.
    ///
    /// `limit <= 0` returns the whole log.
    pub async fn recent(&self, limit: i64) -> Vec<Message> {
        let messages = self.messages.read().await;
        let len = messages.len();
        let take = match usize::try_from(limit) {
            Ok(n) if n > 0 && n < len => n,
            _ => len,
        };
        messages.iter().skip(len - take).cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.messages.read().await.len()
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}
