//! HTTP surface and WebSocket entry point.
//!
//! ```text
//!             ┌── GET /health
//!             ├── GET /api/stats
//! axum Router ├── GET /api/users      ──► PresenceStore
//!             ├── GET /api/messages   ──► HistoryStore
//!             └── GET /ws ── upgrade ──► Session ──► Hub
//! ```
//!
//! Background tasks: the Hub control loop (spawned by [`ChatServer::new`])
//! and the inactivity sweeper (spawned by [`ChatServer::serve`]).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::history::HistoryStore;
use crate::hub::Hub;
use crate::presence::PresenceStore;
use crate::protocol::{ConnectionKey, Identity, Message};
use crate::session::Session;

/// `/api/messages` page size when `limit` is absent or unparsable.
pub const DEFAULT_MESSAGES_LIMIT: i64 = 50;

/// Point-in-time server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub online_users: usize,
    pub total_messages: usize,
    pub uptime_seconds: u64,
    pub live_sessions: usize,
    pub sessions_dropped: u64,
}

/// Shared state handed to every handler and session.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub presence: Arc<PresenceStore>,
    pub history: Arc<HistoryStore>,
    pub hub: Hub,
    pub dispatcher: Arc<Dispatcher>,
    started_at: Instant,
}

impl AppState {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub async fn stats(&self) -> ChatStats {
        ChatStats {
            online_users: self.presence.count().await,
            total_messages: self.history.count().await,
            uptime_seconds: self.uptime().as_secs(),
            live_sessions: self.hub.live_count().await,
            sessions_dropped: self.hub.stats().sessions_dropped,
        }
    }

    /// Expire users idle for longer than the configured timeout.
    ///
    /// Returns how many were removed.
    pub async fn sweep_inactive(&self) -> usize {
        let expired = self.presence.sweep_inactive(self.config.user_timeout).await;
        let count = expired.len();
        if count > 0 {
            log::info!("Expiring {count} inactive user(s)");
            self.hub.expire(expired).await;
        }
        count
    }
}

/// The chat server.
pub struct ChatServer {
    state: AppState,
}

impl ChatServer {
    /// Build the stores and start the Hub control loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let presence = Arc::new(PresenceStore::new(config.max_users));
        let history = Arc::new(HistoryStore::new(config.max_history, config.max_message_length));
        let hub = Hub::spawn(presence.clone(), history.clone());
        let dispatcher = Arc::new(Dispatcher::new(presence.clone(), history.clone(), hub.clone()));

        Self {
            state: AppState {
                config: Arc::new(config),
                presence,
                history,
                hub,
                dispatcher,
                started_at: Instant::now(),
            },
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn stats(&self) -> ChatStats {
        self.state.stats().await
    }

    /// The full route table with CORS applied.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health))
            .route("/api/stats", get(stats))
            .route("/api/users", get(users))
            .route("/api/messages", get(messages))
            .route("/ws", get(ws_upgrade))
            .layer(cors_layer(&self.state.config.cors_origin))
            .with_state(self.state.clone())
    }

    /// Serve on an already-bound listener until the process exits.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        let state = &self.state;
        log::info!(
            "Chat server listening on {} (max {} users, {} messages kept, {} chars per message)",
            listener.local_addr()?,
            state.presence.max_users(),
            state.config.max_history,
            state.history.max_length(),
        );

        let sweeper = spawn_sweeper(self.state.clone());
        let result = axum::serve(listener, self.router()).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        if let Err(e) = &result {
            log::error!("Server stopped: {e}");
        }
        result
    }

    /// Bind the configured address and serve.
    pub async fn run(self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }
}

fn spawn_sweeper(state: AppState) -> Option<JoinHandle<()>> {
    let period = state.config.sweep_interval;
    if period.is_zero() {
        log::debug!("Inactivity sweeper disabled");
        return None;
    }
    log::info!(
        "Expiring users idle for {:?}, checked every {period:?}",
        state.config.user_timeout
    );

    Some(tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            state.sweep_inactive().await;
        }
    }))
}

/// CORS for the single configured origin.
pub fn cors_layer(origin: &str) -> CorsLayer {
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(AllowOrigin::exact(value))
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::ORIGIN,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::AUTHORIZATION,
            ])
            .allow_credentials(true),
        Err(_) => {
            log::warn!("CORS: invalid origin {origin:?}, allowing any origin without credentials");
            CorsLayer::new()
                .allow_origin(AllowOrigin::any())
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UsersResponse {
    pub users: Vec<Identity>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub messages: Vec<Message>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    limit: Option<String>,
}

/// `limit` as given, or the default when missing or not an integer.
fn parse_limit(raw: Option<&str>) -> i64 {
    raw.and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MESSAGES_LIMIT)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
        uptime_seconds: state.uptime().as_secs(),
    })
}

async fn stats(State(state): State<AppState>) -> Json<ChatStats> {
    Json(state.stats().await)
}

async fn users(State(state): State<AppState>) -> Json<UsersResponse> {
    let users = state.presence.list_online().await;
    let count = users.len();
    Json(UsersResponse { users, count })
}

async fn messages(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
) -> Json<MessagesResponse> {
    let limit = parse_limit(query.limit.as_deref());
    let messages = state.history.recent(limit).await;
    let count = messages.len();
    Json(MessagesResponse { messages, count })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let max_frame = state.config.session.max_frame_bytes;
    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let key = ConnectionKey::new();
    log::debug!("Connection {key} upgraded");
    let (sink, stream) = socket.split();
    Session::new(key, state.config.session.clone())
        .run(sink, stream, &state.hub, &state.dispatcher)
        .await;
}
