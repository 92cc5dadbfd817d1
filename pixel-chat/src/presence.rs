//! Presence store: who is currently in the room.
//!
//! One [`Identity`] per joined connection, keyed by [`ConnectionKey`].
//! Mutations take the write half of the lock; lookups and listings share the
//! read half, so any number of readers proceed together but never alongside
//! a mutation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use rand::Rng;
use tokio::sync::RwLock;

use crate::error::ChatError;
use crate::protocol::{ConnectionKey, Identity};

/// Symbols an avatar code is drawn from; each maps to a palette color client-side.
pub const AVATAR_PALETTE: &[u8] = b"012345";

/// Number of symbols in an avatar code.
pub const AVATAR_LEN: usize = 16;

/// Concurrency-safe registry of joined users.
pub struct PresenceStore {
    users: RwLock<HashMap<ConnectionKey, Identity>>,
    max_users: usize,
}

impl PresenceStore {
    /// Create an empty store admitting at most `max_users` identities.
    pub fn new(max_users: usize) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            max_users,
        }
    }

    /// Admit a new identity for `key`.
    ///
    /// The display id is drawn from a 16-bit space without a collision check,
    /// so two online users may share one. Connection keys stay unique.
    pub async fn create(
        &self,
        key: ConnectionKey,
        display_name: impl Into<String>,
    ) -> Result<Identity, ChatError> {
        let mut users = self.users.write().await;
        if users.contains_key(&key) {
            return Err(ChatError::AlreadyJoined);
        }
        if users.len() >= self.max_users {
            return Err(ChatError::RoomFull);
        }

        let now = Utc::now();
        let identity = Identity {
            id: generate_display_id(),
            connection_key: key,
            display_name: display_name.into(),
            avatar_code: generate_avatar_code(),
            joined_at: now,
            last_active_at: now,
            online: true,
        };
        users.insert(key, identity.clone());
        Ok(identity)
    }

    /// Remove the identity for `key`. A second call returns `None`.
    pub async fn remove(&self, key: &ConnectionKey) -> Option<Identity> {
        self.users.write().await.remove(key)
    }

    /// Refresh the activity timestamp. No-op if `key` has not joined.
    pub async fn touch(&self, key: &ConnectionKey) {
        if let Some(identity) = self.users.write().await.get_mut(key) {
            identity.last_active_at = Utc::now();
        }
    }

    pub async fn get(&self, key: &ConnectionKey) -> Option<Identity> {
        self.users.read().await.get(key).cloned()
    }

    /// Snapshot of online identities, oldest join first.
    pub async fn list_online(&self) -> Vec<Identity> {
        let mut online: Vec<Identity> = self
            .users
            .read()
            .await
            .values()
            .filter(|identity| identity.online)
            .cloned()
            .collect();
        online.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        online
    }

    pub async fn count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Configured capacity.
    pub fn max_users(&self) -> usize {
        self.max_users
    }

    /// Remove every identity idle for longer than `timeout`, returning them.
    pub async fn sweep_inactive(&self, timeout: Duration) -> Vec<Identity> {
        let Ok(timeout) = TimeDelta::from_std(timeout) else {
            return Vec::new();
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(timeout) else {
            return Vec::new();
        };

        let mut users = self.users.write().await;
        let stale: Vec<ConnectionKey> = users
            .iter()
            .filter(|(_, identity)| identity.last_active_at < cutoff)
            .map(|(key, _)| *key)
            .collect();

        stale.iter().filter_map(|key| users.remove(key)).collect()
    }
}

fn generate_display_id() -> String {
    let n: u32 = rand::rng().random_range(0..0xFFFF);
    format!("User#{n:04X}")
}

fn generate_avatar_code() -> String {
    let mut rng = rand::rng();
    (0..AVATAR_LEN)
        .map(|_| AVATAR_PALETTE[rng.random_range(0..AVATAR_PALETTE.len())] as char)
        .collect()
}
