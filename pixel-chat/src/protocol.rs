//! JSON wire protocol for the chat room.
//!
//! Every frame in both directions is one envelope:
//! ```text
//! ┌────────────────────┬──────────────────────────────┐
//! │ "type": string     │ "data": type-specific object │
//! └────────────────────┴──────────────────────────────┘
//! ```
//!
//! Client → server: `join`, `send_message`, `ping`.
//! Server → client: `joined`, `error`, `user_joined`, `user_left`,
//! `user_list`, `new_message`, `pong`.
//!
//! Server events are encoded once per broadcast and the resulting [`Frame`]
//! is shared by every receiving session.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// An encoded server event, ready to be written to any number of sessions.
pub type Frame = Arc<str>;

/// Opaque identifier of one accepted transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionKey(Uuid);

impl ConnectionKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A joined user's presence record.
///
/// Field names on the wire follow the browser client (`nickname`, `avatar`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Display id (`User#XXXX`). Not unique, see `PresenceStore::create`.
    pub id: String,
    #[serde(rename = "socket_id")]
    pub connection_key: ConnectionKey,
    #[serde(rename = "nickname")]
    pub display_name: String,
    /// 16 palette symbols describing an 8×8 pixel icon.
    #[serde(rename = "avatar")]
    pub avatar_code: String,
    #[serde(rename = "join_time")]
    pub joined_at: DateTime<Utc>,
    #[serde(rename = "last_activity")]
    pub last_active_at: DateTime<Utc>,
    #[serde(rename = "is_online")]
    pub online: bool,
}

/// Kind of a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
}

/// One chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    #[serde(rename = "user_id")]
    pub author_id: String,
    #[serde(rename = "user_nickname")]
    pub author_name: String,
    #[serde(rename = "user_avatar")]
    pub author_avatar: String,
    #[serde(rename = "content")]
    pub body: String,
    #[serde(rename = "timestamp")]
    pub at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
}

/// A decoded client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Join { nickname: String },
    SendMessage { content: String },
    Ping,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct JoinRequest {
    #[serde(default)]
    nickname: String,
}

#[derive(Deserialize)]
struct SendMessageRequest {
    content: String,
}

impl ClientCommand {
    pub const JOIN: &'static str = "join";
    pub const SEND_MESSAGE: &'static str = "send_message";
    pub const PING: &'static str = "ping";

    /// Decode one inbound text frame.
    ///
    /// The envelope is decoded first; the payload is only checked once the
    /// command type is known, so a malformed payload for a known command is
    /// reported as [`ProtocolError::InvalidPayload`] rather than [`ProtocolError::Decode`].
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))?;

        match envelope.kind.as_str() {
            Self::JOIN => {
                let req: JoinRequest = serde_json::from_value(envelope.data)
                    .map_err(|e| ProtocolError::invalid_payload(Self::JOIN, e))?;
                Ok(Self::Join { nickname: req.nickname })
            }
            Self::SEND_MESSAGE => {
                let req: SendMessageRequest = serde_json::from_value(envelope.data)
                    .map_err(|e| ProtocolError::invalid_payload(Self::SEND_MESSAGE, e))?;
                Ok(Self::SendMessage { content: req.content })
            }
            Self::PING => Ok(Self::Ping),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Encode as a client frame. Used by clients and tests.
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Join { nickname } => serde_json::json!({
                "type": Self::JOIN,
                "data": { "nickname": nickname },
            }),
            Self::SendMessage { content } => serde_json::json!({
                "type": Self::SEND_MESSAGE,
                "data": { "content": content },
            }),
            Self::Ping => serde_json::json!({ "type": Self::PING, "data": {} }),
        };
        value.to_string()
    }
}

/// Every event the server sends, as a closed union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Private reply to a successful `join`.
    Joined { user: Identity, messages: Vec<Message> },
    /// Private domain error.
    Error { message: String },
    UserJoined { user: Identity },
    UserLeft { user: Identity },
    UserList { users: Vec<Identity> },
    NewMessage { message: Message },
    Pong {},
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    /// Wire name of this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::Error { .. } => "error",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserList { .. } => "user_list",
            Self::NewMessage { .. } => "new_message",
            Self::Pong {} => "pong",
        }
    }

    /// Serialize to a shareable frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parse a server frame. Used by clients and tests.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Decode(String),
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),
    #[error("Invalid payload for '{command}': {reason}")]
    InvalidPayload { command: &'static str, reason: String },
    #[error("Failed to encode event: {0}")]
    Encode(String),
}

impl ProtocolError {
    fn invalid_payload(command: &'static str, err: serde_json::Error) -> Self {
        Self::InvalidPayload {
            command,
            reason: err.to_string(),
        }
    }
}
