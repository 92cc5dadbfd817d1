//! # pixel-chat — Real-time broadcast chat server
//!
//! Clients connect over WebSocket, join one shared room, exchange short text
//! messages and observe who else is online.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket    ┌─────────────┐  HubCommand  ┌─────────────┐
//! │ Browser     │ ◄────────────► │ Session     │ ───────────► │ Hub         │
//! │ (per user)  │   JSON frames  │ read/write  │              │ (one loop)  │
//! └─────────────┘                └──────┬──────┘              └──────┬──────┘
//!                                       │                            │
//!                                       ▼                            ▼
//!                                ┌─────────────┐             ┌──────────────┐
//!                                │ Dispatcher  │ ──────────► │ Presence /   │
//!                                │             │             │ History      │
//!                                └─────────────┘             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope, data model, client commands and server events
//! - [`presence`] — Who is in the room
//! - [`history`] — Bounded message log
//! - [`session`] — Per-connection loops and outbound queue
//! - [`hub`] — Live-session set and fan-out with backpressure
//! - [`dispatch`] — Client command handling
//! - [`server`] — HTTP routes, WebSocket upgrade, inactivity sweeper
//! - [`config`] — Defaults and CLI/environment loading

pub mod config;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use config::{Cli, ServerConfig, SessionConfig};
pub use dispatch::Dispatcher;
pub use error::ChatError;
pub use history::HistoryStore;
pub use hub::{Hub, HubLoop, HubStats};
pub use presence::PresenceStore;
pub use protocol::{
    ClientCommand, ConnectionKey, Frame, Identity, Message, MessageKind, ProtocolError,
    ServerEvent,
};
pub use server::{AppState, ChatServer, ChatStats};
pub use session::{Session, SessionError, SessionHandle, SessionState, TrySendError};
