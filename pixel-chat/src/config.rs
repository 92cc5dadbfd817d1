//! Server and session configuration.
//!
//! [`ServerConfig::default`] gives a runnable setup; the binary overrides it
//! from command-line flags or the environment through [`Cli`].

use std::time::Duration;

use clap::Parser;

/// Per-connection timing and buffering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Idle read deadline. A peer silent for longer (no frames, no pongs) is dead.
    pub pong_wait: Duration,
    /// Keep-alive probe period. Always shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for a single transport write.
    pub write_wait: Duration,
    /// Largest inbound frame accepted.
    pub max_frame_bytes: usize,
    /// Capacity of the private outbound queue.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::default_with_pong_wait(Duration::from_secs(60))
    }
}

impl SessionConfig {
    fn default_with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            pong_wait,
            ping_period: pong_wait * 9 / 10,
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 4096,
            outbound_capacity: 256,
        }
    }

    /// Set the idle deadline and derive the probe period from it.
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Origin allowed by CORS
    pub cors_origin: String,
    /// Maximum joined users in the room
    pub max_users: usize,
    /// Maximum characters in one message body
    pub max_message_length: usize,
    /// Number of messages retained in history
    pub max_history: usize,
    /// Idle time after which a joined user is expired
    pub user_timeout: Duration,
    /// How often to look for expired users. Zero, the default, disables the
    /// sweeper; live sessions are otherwise ended only by the transport.
    pub sweep_interval: Duration,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3001".to_string(),
            cors_origin: "http://localhost:3000".to_string(),
            max_users: 100,
            max_message_length: 500,
            max_history: 1000,
            user_timeout: Duration::from_secs(300),
            sweep_interval: Duration::ZERO,
            session: SessionConfig::default(),
        }
    }
}

/// Command-line flags, each also readable from the environment.
#[derive(Debug, Parser)]
#[command(name = "pixel-chat", version, about = "Real-time broadcast chat server")]
pub struct Cli {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_origin: String,

    #[arg(long, env = "MAX_USERS_PER_ROOM", default_value_t = 100)]
    pub max_users_per_room: usize,

    #[arg(long, env = "MAX_MESSAGE_LENGTH", default_value_t = 500)]
    pub max_message_length: usize,

    #[arg(long, env = "MAX_MESSAGES_HISTORY", default_value_t = 1000)]
    pub max_messages_history: usize,

    #[arg(long, env = "USER_TIMEOUT_SECONDS", default_value_t = 300)]
    pub user_timeout_seconds: u64,

    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value_t = 0)]
    pub sweep_interval_seconds: u64,

    #[arg(long, env = "PONG_WAIT_SECONDS", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    pub pong_wait_seconds: u64,

    #[arg(long, env = "WRITE_WAIT_SECONDS", default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub write_wait_seconds: u64,

    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = 4096)]
    pub max_frame_bytes: usize,

    #[arg(long, env = "OUTBOUND_QUEUE_CAPACITY", default_value_t = 256)]
    pub outbound_queue_capacity: usize,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        let session = SessionConfig {
            write_wait: Duration::from_secs(self.write_wait_seconds),
            max_frame_bytes: self.max_frame_bytes,
            outbound_capacity: self.outbound_queue_capacity.max(1),
            ..SessionConfig::default()
        }
        .with_pong_wait(Duration::from_secs(self.pong_wait_seconds));

        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            cors_origin: self.cors_origin,
            max_users: self.max_users_per_room,
            max_message_length: self.max_message_length,
            max_history: self.max_messages_history,
            user_timeout: Duration::from_secs(self.user_timeout_seconds),
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            session,
        }
    }
}
