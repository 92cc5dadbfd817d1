//! Domain errors surfaced to the originating session as a private `error` event.

use thiserror::Error;

/// Domain-level failures. None of these affect other sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("room is full")]
    RoomFull,

    #[error("already joined")]
    AlreadyJoined,

    #[error("message cannot be empty")]
    EmptyMessage,

    #[error("message is too long (max {max} characters)")]
    MessageTooLong { max: usize },

    #[error("join the room first")]
    NotJoined,

    /// A known command arrived with a payload that could not be decoded.
    #[error("{0}")]
    InvalidRequest(&'static str),
}

impl ChatError {
    /// Whether this is a message-body validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::EmptyMessage | Self::MessageTooLong { .. })
    }
}
