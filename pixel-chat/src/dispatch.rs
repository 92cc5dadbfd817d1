//! Command dispatch: turns one decoded client frame into store updates,
//! private replies and Hub broadcasts.

use std::sync::Arc;

use crate::error::ChatError;
use crate::history::{Author, HistoryStore};
use crate::hub::Hub;
use crate::presence::PresenceStore;
use crate::protocol::{ClientCommand, MessageKind, ProtocolError, ServerEvent};
use crate::session::{SessionHandle, TrySendError};

/// History entries included in the private `joined` reply.
pub const JOIN_HISTORY_LIMIT: i64 = 50;

/// Shared by every session; holds no per-session state.
pub struct Dispatcher {
    presence: Arc<PresenceStore>,
    history: Arc<HistoryStore>,
    hub: Hub,
}

impl Dispatcher {
    pub fn new(presence: Arc<PresenceStore>, history: Arc<HistoryStore>, hub: Hub) -> Self {
        Self {
            presence,
            history,
            hub,
        }
    }

    /// Handle one inbound frame for `session`.
    ///
    /// Undecodable frames and unknown command types are dropped without a
    /// reply. A known command with a bad payload gets a private error.
    pub async fn dispatch(&self, session: &SessionHandle, frame: &str) {
        if session.is_closed() {
            log::debug!("Session {}: ignoring frame on closed session", session.key());
            return;
        }

        let command = match ClientCommand::decode(frame) {
            Ok(command) => command,
            Err(ProtocolError::InvalidPayload { command, reason }) => {
                log::debug!("Session {}: bad '{command}' payload: {reason}", session.key());
                let message = if command == ClientCommand::JOIN {
                    "invalid join request"
                } else {
                    "invalid message request"
                };
                self.reply_error(session, &ChatError::InvalidRequest(message)).await;
                return;
            }
            Err(e) => {
                log::debug!("Session {}: dropping frame: {e}", session.key());
                return;
            }
        };

        match command {
            ClientCommand::Join { nickname } => self.join(session, nickname).await,
            ClientCommand::SendMessage { content } => self.send_message(session, content).await,
            ClientCommand::Ping => self.reply(session, &ServerEvent::Pong {}).await,
        }
    }

    /// Refresh the joined user's activity time. Called for every inbound
    /// frame, so a reader that only answers keep-alives still counts as active.
    pub async fn record_activity(&self, session: &SessionHandle) {
        self.presence.touch(&session.key()).await;
    }

    async fn join(&self, session: &SessionHandle, nickname: String) {
        let identity = match self.presence.create(session.key(), nickname).await {
            Ok(identity) => identity,
            Err(e) => {
                log::debug!("Session {}: join rejected: {e}", session.key());
                self.reply_error(session, &e).await;
                return;
            }
        };
        log::info!("{} ({}) joined", identity.display_name, identity.id);

        self.history
            .append_system(format!("{} joined the room", identity.display_name))
            .await;
        let messages = self.history.recent(JOIN_HISTORY_LIMIT).await;
        self.reply(
            session,
            &ServerEvent::Joined {
                user: identity.clone(),
                messages,
            },
        )
        .await;

        self.hub.broadcast(ServerEvent::UserJoined { user: identity }).await;
        self.hub.broadcast_user_list().await;
    }

    async fn send_message(&self, session: &SessionHandle, content: String) {
        let key = session.key();
        let Some(identity) = self.presence.get(&key).await else {
            self.reply_error(session, &ChatError::NotJoined).await;
            return;
        };
        self.presence.touch(&key).await;

        let author = Author {
            id: &identity.id,
            name: &identity.display_name,
            avatar: &identity.avatar_code,
        };
        match self.history.append(author, content, MessageKind::Text).await {
            Ok(message) => self.hub.broadcast(ServerEvent::NewMessage { message }).await,
            Err(e) => {
                if e.is_validation() {
                    log::debug!("Session {key}: message rejected: {e}");
                } else {
                    log::warn!("Session {key}: message not stored: {e}");
                }
                self.reply_error(session, &e).await;
            }
        }
    }

    async fn reply_error(&self, session: &SessionHandle, error: &ChatError) {
        self.reply(session, &ServerEvent::error(error.to_string())).await;
    }

    /// Private send. A full queue drops the session the same way a broadcast would.
    async fn reply(&self, session: &SessionHandle, event: &ServerEvent) {
        let frame = match event.encode() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Dropping '{}' reply: {e}", event.name());
                return;
            }
        };
        match session.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full) => {
                log::debug!("Session {} outbound queue full, dropping it", session.key());
                session.close();
                self.hub.unregister(session.key()).await;
            }
            Err(TrySendError::Closed) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectionKey, Identity};
    use crate::session::{outbound_channel, Outbound};
    use crate::testing::{assert_quiet, next_event};

    struct Fixture {
        dispatcher: Dispatcher,
        hub: Hub,
        presence: Arc<PresenceStore>,
        history: Arc<HistoryStore>,
    }

    impl Fixture {
        fn new(max_users: usize, max_length: usize) -> Self {
            let presence = Arc::new(PresenceStore::new(max_users));
            let history = Arc::new(HistoryStore::new(100, max_length));
            let hub = Hub::spawn(presence.clone(), history.clone());
            let dispatcher = Dispatcher::new(presence.clone(), history.clone(), hub.clone());
            Self {
                dispatcher,
                hub,
                presence,
                history,
            }
        }

        async fn connect(&self) -> (SessionHandle, Outbound) {
            let (handle, outbound) = outbound_channel(ConnectionKey::new(), 32);
            self.hub.register(handle.clone()).await;
            (handle, outbound)
        }

        async fn send(&self, session: &SessionHandle, command: ClientCommand) {
            self.dispatcher.dispatch(session, &command.encode()).await;
        }

        /// Join and drain the join traffic from the joiner's own queue.
        async fn joined(&self, name: &str) -> (SessionHandle, Outbound, Identity) {
            let (handle, mut rx) = self.connect().await;
            self.send(&handle, ClientCommand::Join { nickname: name.into() }).await;
            let user = match next_event(&mut rx).await {
                ServerEvent::Joined { user, .. } => user,
                other => panic!("expected joined, got {other:?}"),
            };
            assert!(matches!(next_event(&mut rx).await, ServerEvent::UserJoined { .. }));
            assert!(matches!(next_event(&mut rx).await, ServerEvent::UserList { .. }));
            (handle, rx, user)
        }
    }

    fn join(name: &str) -> ClientCommand {
        ClientCommand::Join { nickname: name.into() }
    }

    fn say(content: &str) -> ClientCommand {
        ClientCommand::SendMessage { content: content.into() }
    }

    #[tokio::test]
    async fn test_join_replies_then_broadcasts() {
        let fx = Fixture::new(10, 500);
        let (_bob, mut bob_rx, _) = fx.joined("bob").await;
        let (alice, mut alice_rx) = fx.connect().await;

        fx.send(&alice, join("alice")).await;

        match next_event(&mut alice_rx).await {
            ServerEvent::Joined { user, messages } => {
                assert_eq!(user.display_name, "alice");
                assert_eq!(user.connection_key, alice.key());
                let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
                assert_eq!(bodies, vec!["bob joined the room", "alice joined the room"]);
            }
            other => panic!("expected joined, got {other:?}"),
        }
        for rx in [&mut alice_rx, &mut bob_rx] {
            match next_event(rx).await {
                ServerEvent::UserJoined { user } => assert_eq!(user.display_name, "alice"),
                other => panic!("expected user_joined, got {other:?}"),
            }
            match next_event(rx).await {
                ServerEvent::UserList { users } => assert_eq!(users.len(), 2),
                other => panic!("expected user_list, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_joined_history_is_capped() {
        let fx = Fixture::new(10, 500);
        for i in 0..60 {
            fx.history.append_system(format!("filler {i}")).await;
        }
        let (alice, mut rx) = fx.connect().await;
        fx.send(&alice, join("alice")).await;

        match next_event(&mut rx).await {
            ServerEvent::Joined { messages, .. } => {
                assert_eq!(messages.len(), JOIN_HISTORY_LIMIT as usize);
                assert_eq!(messages.last().unwrap().body, "alice joined the room");
            }
            other => panic!("expected joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_room_full_is_private() {
        let fx = Fixture::new(2, 500);
        let (_a, mut a_rx, _) = fx.joined("alice").await;
        let (_b, _b_rx, _) = fx.joined("bob").await;
        // alice saw bob's arrival.
        assert!(matches!(next_event(&mut a_rx).await, ServerEvent::UserJoined { .. }));
        assert!(matches!(next_event(&mut a_rx).await, ServerEvent::UserList { .. }));

        let (carol, mut carol_rx) = fx.connect().await;
        fx.send(&carol, join("carol")).await;

        assert_eq!(next_event(&mut carol_rx).await, ServerEvent::error("room is full"));
        assert_eq!(fx.hub.live_count().await, 3);
        assert_quiet(&mut a_rx);
        assert_eq!(fx.presence.count().await, 2);
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let fx = Fixture::new(10, 500);
        let (alice, mut rx, first) = fx.joined("alice").await;

        fx.send(&alice, join("mallory")).await;

        assert_eq!(next_event(&mut rx).await, ServerEvent::error("already joined"));
        assert_eq!(fx.presence.get(&alice.key()).await, Some(first));
    }

    #[tokio::test]
    async fn test_message_before_join() {
        let fx = Fixture::new(10, 500);
        let (anon, mut rx) = fx.connect().await;

        fx.send(&anon, say("hello")).await;

        assert_eq!(next_event(&mut rx).await, ServerEvent::error("join the room first"));
        assert_eq!(fx.history.count().await, 0);
    }

    #[tokio::test]
    async fn test_message_broadcast_to_everyone() {
        let fx = Fixture::new(10, 500);
        let (alice, mut alice_rx, identity) = fx.joined("alice").await;
        let (_bob, mut bob_rx, _) = fx.joined("bob").await;
        let _ = next_event(&mut alice_rx).await;
        let _ = next_event(&mut alice_rx).await;

        fx.send(&alice, say("hi")).await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            match next_event(rx).await {
                ServerEvent::NewMessage { message } => {
                    assert_eq!(message.body, "hi");
                    assert_eq!(message.author_id, identity.id);
                    assert_eq!(message.author_name, "alice");
                    assert_eq!(message.author_avatar, identity.avatar_code);
                    assert_eq!(message.kind, MessageKind::Text);
                }
                other => panic!("expected new_message, got {other:?}"),
            }
        }

        let after = fx.presence.get(&alice.key()).await.unwrap();
        assert!(after.last_active_at >= identity.last_active_at);
    }

    #[tokio::test]
    async fn test_messages_from_one_sender_arrive_in_send_order() {
        let fx = Fixture::new(10, 500);
        let (alice, _alice_rx, _) = fx.joined("alice").await;
        let (_bob, mut bob_rx, _) = fx.joined("bob").await;

        for body in ["one", "two", "three"] {
            fx.send(&alice, say(body)).await;
        }

        let mut seen = Vec::new();
        while seen.len() < 3 {
            if let ServerEvent::NewMessage { message } = next_event(&mut bob_rx).await {
                seen.push(message.body);
            }
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_record_activity_refreshes_joined_user() {
        let fx = Fixture::new(10, 500);
        let (alice, _rx, identity) = fx.joined("alice").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        fx.dispatcher.record_activity(&alice).await;

        let after = fx.presence.get(&alice.key()).await.unwrap();
        assert!(after.last_active_at > identity.last_active_at);

        // Anonymous sessions have nothing to refresh.
        let (anon, _anon_rx) = fx.connect().await;
        fx.dispatcher.record_activity(&anon).await;
        assert_eq!(fx.presence.count().await, 1);
    }

    #[tokio::test]
    async fn test_validation_errors_are_private() {
        let fx = Fixture::new(10, 5);
        let (alice, mut alice_rx, _) = fx.joined("alice").await;
        let (_bob, mut bob_rx, _) = fx.joined("bob").await;
        let _ = next_event(&mut alice_rx).await;
        let _ = next_event(&mut alice_rx).await;
        let before = fx.history.count().await;

        fx.send(&alice, say("hello!")).await;
        assert_eq!(
            next_event(&mut alice_rx).await,
            ServerEvent::error("message is too long (max 5 characters)")
        );

        fx.send(&alice, say("")).await;
        assert_eq!(
            next_event(&mut alice_rx).await,
            ServerEvent::error("message cannot be empty")
        );

        assert_eq!(fx.hub.live_count().await, 2);
        assert_quiet(&mut bob_rx);
        assert_eq!(fx.history.count().await, before);
    }

    #[tokio::test]
    async fn test_ping_pong_without_join() {
        let fx = Fixture::new(10, 500);
        let (anon, mut rx) = fx.connect().await;

        fx.send(&anon, ClientCommand::Ping).await;

        assert_eq!(next_event(&mut rx).await, ServerEvent::Pong {});
        assert_eq!(fx.presence.count().await, 0);
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_dropped() {
        let fx = Fixture::new(10, 500);
        let (anon, mut rx) = fx.connect().await;

        fx.dispatcher.dispatch(&anon, "{{{ not json").await;
        fx.dispatcher.dispatch(&anon, r#"{"type":"typing","data":{}}"#).await;

        assert_eq!(fx.hub.live_count().await, 1);
        assert_quiet(&mut rx);
    }

    #[tokio::test]
    async fn test_bad_payload_gets_private_error() {
        let fx = Fixture::new(10, 500);
        let (anon, mut rx) = fx.connect().await;

        fx.dispatcher.dispatch(&anon, r#"{"type":"join","data":[1,2]}"#).await;
        assert_eq!(next_event(&mut rx).await, ServerEvent::error("invalid join request"));

        fx.dispatcher
            .dispatch(&anon, r#"{"type":"send_message","data":{"content":7}}"#)
            .await;
        assert_eq!(next_event(&mut rx).await, ServerEvent::error("invalid message request"));
    }

    #[tokio::test]
    async fn test_closed_session_is_ignored() {
        let fx = Fixture::new(10, 500);
        let (anon, _rx) = fx.connect().await;
        anon.close();

        fx.send(&anon, join("ghost")).await;

        assert_eq!(fx.presence.count().await, 0);
        assert_eq!(fx.history.count().await, 0);
    }

    #[tokio::test]
    async fn test_full_private_queue_drops_session() {
        let fx = Fixture::new(10, 500);
        let (_watcher, mut watcher_rx, _) = fx.joined("watcher").await;

        let (slow, _slow_rx) = outbound_channel(ConnectionKey::new(), 3);
        fx.hub.register(slow.clone()).await;
        // joined + user_joined + user_list fill the queue exactly.
        fx.send(&slow, join("slow")).await;
        assert_eq!(fx.hub.live_count().await, 2);
        let _ = next_event(&mut watcher_rx).await;
        let _ = next_event(&mut watcher_rx).await;

        fx.send(&slow, ClientCommand::Ping).await;
        assert!(slow.is_closed());

        assert_eq!(fx.hub.live_count().await, 1);
        match next_event(&mut watcher_rx).await {
            ServerEvent::UserLeft { user } => assert_eq!(user.display_name, "slow"),
            other => panic!("expected user_left, got {other:?}"),
        }
        assert!(fx.presence.get(&slow.key()).await.is_none());
    }
}
