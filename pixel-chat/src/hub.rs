//! Hub: the single owner of the live-session set.
//!
//! Every registration, unregistration and broadcast is a [`HubCommand`] sent
//! into one control loop, so they are totally ordered by arrival and the
//! session map is never touched from two tasks.
//!
//! ```text
//!  Session ──register/unregister──┐
//!  Dispatcher ──broadcast─────────┼──► mpsc ──► HubLoop ──try_send──► N sessions
//!  Sweeper ──expire───────────────┘                │
//!                                                  └── departures (presence, history)
//! ```
//!
//! Backpressure: a session whose queue is full when a frame is fanned out is
//! closed and dropped in the same pass, then gets the same departure as a
//! normal disconnect (`user_left` + `user_list` to everyone left).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::history::HistoryStore;
use crate::presence::PresenceStore;
use crate::protocol::{ConnectionKey, Identity, ServerEvent};
use crate::session::{SessionHandle, TrySendError};

/// Buffered commands before callers start waiting on the control loop.
pub const HUB_QUEUE_CAPACITY: usize = 1024;

/// Requests admitted by the control loop, processed one at a time.
#[derive(Debug)]
pub enum HubCommand {
    Register(SessionHandle),
    Unregister(ConnectionKey),
    Broadcast(ServerEvent),
    /// Broadcast a `user_list` snapshot taken when the command is processed.
    BroadcastUserList,
    /// Identities already removed from presence by the inactivity sweep.
    Expire(Vec<Identity>),
    LiveCount(oneshot::Sender<usize>),
}

/// Fan-out counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub broadcasts: u64,
    pub frames_sent: u64,
    pub sessions_dropped: u64,
}

/// Lock-free counters shared between the loop and every handle.
#[derive(Default)]
struct AtomicHubStats {
    broadcasts: AtomicU64,
    frames_sent: AtomicU64,
    sessions_dropped: AtomicU64,
}

/// Cheap, cloneable handle for talking to the control loop.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    stats: Arc<AtomicHubStats>,
}

/// The control loop itself. Owns the live-session set.
pub struct HubLoop {
    commands: mpsc::Receiver<HubCommand>,
    sessions: HashMap<ConnectionKey, SessionHandle>,
    presence: Arc<PresenceStore>,
    history: Arc<HistoryStore>,
    stats: Arc<AtomicHubStats>,
}

impl Hub {
    /// Create a handle and its (not yet running) control loop.
    pub fn new(presence: Arc<PresenceStore>, history: Arc<HistoryStore>) -> (Self, HubLoop) {
        Self::with_capacity(presence, history, HUB_QUEUE_CAPACITY)
    }

    /// Like `new`, with `capacity` pending commands before callers wait.
    pub fn with_capacity(
        presence: Arc<PresenceStore>,
        history: Arc<HistoryStore>,
        capacity: usize,
    ) -> (Self, HubLoop) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(AtomicHubStats::default());
        let hub = Self {
            commands: tx,
            stats: stats.clone(),
        };
        let hub_loop = HubLoop {
            commands: rx,
            sessions: HashMap::new(),
            presence,
            history,
            stats,
        };
        (hub, hub_loop)
    }

    /// Create a handle and run its control loop on the current runtime.
    pub fn spawn(presence: Arc<PresenceStore>, history: Arc<HistoryStore>) -> Self {
        let (hub, hub_loop) = Self::new(presence, history);
        tokio::spawn(hub_loop.run());
        hub
    }

    pub async fn register(&self, session: SessionHandle) {
        self.send(HubCommand::Register(session)).await;
    }

    /// Remove a session and run its departure. Safe to call more than once.
    pub async fn unregister(&self, key: ConnectionKey) {
        self.send(HubCommand::Unregister(key)).await;
    }

    pub async fn broadcast(&self, event: ServerEvent) {
        self.send(HubCommand::Broadcast(event)).await;
    }

    pub async fn broadcast_user_list(&self) {
        self.send(HubCommand::BroadcastUserList).await;
    }

    pub async fn expire(&self, identities: Vec<Identity>) {
        if identities.is_empty() {
            return;
        }
        self.send(HubCommand::Expire(identities)).await;
    }

    /// Number of live sessions, answered by the control loop.
    ///
    /// Because the answer is queued behind every earlier command, awaiting it
    /// also waits for those commands to be processed.
    pub async fn live_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::LiveCount(tx)).await;
        rx.await.unwrap_or(0)
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            sessions_dropped: self.stats.sessions_dropped.load(Ordering::Relaxed),
        }
    }

    async fn send(&self, command: HubCommand) {
        if self.commands.send(command).await.is_err() {
            log::debug!("Hub control loop is gone, command dropped");
        }
    }
}

impl HubLoop {
    /// Process commands until every [`Hub`] handle is dropped.
    pub async fn run(mut self) {
        log::debug!("Hub control loop started");
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(session) => self.register(session),
                HubCommand::Unregister(key) => self.unregister(key).await,
                HubCommand::Broadcast(event) => {
                    let dropped = self.fan_out(&event);
                    self.settle(dropped).await;
                }
                HubCommand::BroadcastUserList => {
                    let dropped = self.fan_out_user_list().await;
                    self.settle(dropped).await;
                }
                HubCommand::Expire(identities) => self.expire(identities).await,
                HubCommand::LiveCount(reply) => {
                    let _ = reply.send(self.sessions.len());
                }
            }
        }
        log::debug!("Hub control loop stopped");
    }

    fn register(&mut self, session: SessionHandle) {
        let key = session.key();
        self.sessions.insert(key, session);
        log::info!("Session {key} registered ({} live)", self.sessions.len());
    }

    async fn unregister(&mut self, key: ConnectionKey) {
        if let Some(session) = self.sessions.remove(&key) {
            session.close();
            log::info!("Session {key} unregistered ({} live)", self.sessions.len());
        }
        // Presence removal is idempotent, so a session already dropped by
        // backpressure or expiry gets no second departure.
        self.settle(vec![key]).await;
    }

    /// Encode once and enqueue on every live session.
    ///
    /// Returns the sessions dropped during this pass.
    fn fan_out(&mut self, event: &ServerEvent) -> Vec<ConnectionKey> {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Dropping '{}' broadcast: {e}", event.name());
                return Vec::new();
            }
        };

        let mut dropped = Vec::new();
        let mut sent = 0u64;
        self.sessions.retain(|key, session| match session.try_send(frame.clone()) {
            Ok(()) => {
                sent += 1;
                true
            }
            Err(TrySendError::Full) => {
                log::debug!("Session {key} outbound queue full, dropping it");
                session.close();
                dropped.push(*key);
                false
            }
            Err(TrySendError::Closed) => {
                dropped.push(*key);
                false
            }
        });

        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.stats.frames_sent.fetch_add(sent, Ordering::Relaxed);
        self.stats
            .sessions_dropped
            .fetch_add(dropped.len() as u64, Ordering::Relaxed);
        dropped
    }

    async fn fan_out_user_list(&mut self) -> Vec<ConnectionKey> {
        let users = self.presence.list_online().await;
        self.fan_out(&ServerEvent::UserList { users })
    }

    /// Append the `left` entry and announce the departure. No `user_list`.
    async fn announce_departure(&mut self, identity: Identity) -> Vec<ConnectionKey> {
        log::info!("{} ({}) left", identity.display_name, identity.id);
        self.history
            .append_system(format!("{} left the room", identity.display_name))
            .await;
        self.fan_out(&ServerEvent::UserLeft { user: identity })
    }

    /// Run departures for `keys` and for every session those departures drop.
    async fn settle(&mut self, keys: Vec<ConnectionKey>) {
        let mut pending: VecDeque<ConnectionKey> = keys.into();
        while let Some(key) = pending.pop_front() {
            let Some(identity) = self.presence.remove(&key).await else {
                continue;
            };
            pending.extend(self.announce_departure(identity).await);
            pending.extend(self.fan_out_user_list().await);
        }
    }

    async fn expire(&mut self, identities: Vec<Identity>) {
        let mut dropped = Vec::new();
        for identity in identities {
            if let Some(session) = self.sessions.remove(&identity.connection_key) {
                session.close();
            }
            log::info!("Expiring idle user {} ({})", identity.display_name, identity.id);
            dropped.extend(self.announce_departure(identity).await);
        }
        dropped.extend(self.fan_out_user_list().await);
        self.settle(dropped).await;
    }
}
