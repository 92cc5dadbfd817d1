//! Per-connection session: one inbound loop, one outbound loop, one private queue.
//!
//! ```text
//!              ┌──────────── Session ────────────┐
//! transport ──►│ read_loop ──► Dispatcher        │
//!              │                  │              │
//!              │      SessionHandle::try_send    │◄── Hub fan-out
//!              │                  ▼              │
//! transport ◄──│ write_loop ◄── outbound queue   │
//!              │      ▲                          │
//!              │  keep-alive ticker              │
//!              └─────────────────────────────────┘
//! ```
//!
//! Lifecycle: `Connecting → Registered → Closing → Closed`. Whichever loop
//! stops first ends the session. A writer exit closes the session handle,
//! which stops the reader the next time it waits for a frame, so a command
//! being dispatched always completes. The Hub is then told to unregister
//! the session and both transport halves are dropped on every exit path.

use std::fmt;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::hub::Hub;
use crate::protocol::{ConnectionKey, Frame};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Closing,
    Closed,
}

/// Why a non-blocking enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TrySendError {
    #[error("outbound queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// Transport-level failures. These end the session and are never reported to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("no frame or keep-alive acknowledgement within {0:?}")]
    IdleTimeout(Duration),
    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("session was closed locally")]
    Closed,
}

/// Sending side of a session, shared by the Hub and the session's own dispatcher.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: ConnectionKey,
    outbound: mpsc::Sender<Frame>,
    closed: CancellationToken,
}

/// Receiving side of a session's outbound queue, owned by its writer.
pub struct Outbound {
    rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
}

/// Create the private outbound queue for a connection.
pub fn outbound_channel(key: ConnectionKey, capacity: usize) -> (SessionHandle, Outbound) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    let handle = SessionHandle {
        key,
        outbound: tx,
        closed: closed.clone(),
    };
    (handle, Outbound { rx, closed })
}

impl SessionHandle {
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Enqueue without waiting.
    ///
    /// `Full` means the consumer is not keeping up; the caller is expected to
    /// drop the session rather than wait for it.
    pub fn try_send(&self, frame: Frame) -> Result<(), TrySendError> {
        if self.closed.is_cancelled() {
            return Err(TrySendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TrySendError::Full,
            mpsc::error::TrySendError::Closed(_) => TrySendError::Closed,
        })
    }

    /// Close the outbound queue. The writer sends a close frame and stops.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Outbound {
    /// Next queued frame, or `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    /// Next queued frame without waiting.
    pub fn try_recv(&mut self) -> Option<Frame> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

/// One accepted connection.
pub struct Session {
    key: ConnectionKey,
    state: SessionState,
    config: SessionConfig,
}

impl Session {
    pub fn new(key: ConnectionKey, config: SessionConfig) -> Self {
        Self {
            key,
            state: SessionState::Connecting,
            config,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("Session {}: {:?} -> {:?}", self.key, self.state, next);
        self.state = next;
    }

    /// Register with the Hub and drive both loops until the connection ends.
    pub async fn run<K, R, E>(mut self, sink: K, mut stream: R, hub: &Hub, dispatcher: &Dispatcher)
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: fmt::Display + Send,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let (handle, outbound) = outbound_channel(self.key, self.config.outbound_capacity);
        hub.register(handle.clone()).await;
        self.transition(SessionState::Registered);

        let writer_config = self.config.clone();
        let writer_handle = handle.clone();
        let writer = tokio::spawn(async move {
            let mut sink = sink;
            let result = write_loop(&mut sink, outbound, &writer_config).await;
            // Stops the reader at its next wait for a frame.
            writer_handle.close();
            let _ = sink.close().await;
            result
        });

        // The reader is never cancelled mid-dispatch, so a command that was
        // already accepted finishes before the departure is announced.
        match read_loop(&mut stream, &handle, dispatcher, &self.config).await {
            Ok(()) => log::info!("Session {} closed by peer", self.key),
            Err(SessionError::Closed) => log::debug!("Session {} reader stopped after close", self.key),
            Err(e) => log::warn!("Session {} read side ended: {e}", self.key),
        }

        self.transition(SessionState::Closing);
        hub.unregister(self.key).await;
        handle.close();

        let joined = writer.await;
        self.log_writer_exit(joined);
        drop(stream);
        self.transition(SessionState::Closed);
    }

    fn log_writer_exit(&self, joined: Result<Result<(), SessionError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(())) => log::debug!("Session {} outbound queue closed", self.key),
            Ok(Err(e)) => log::warn!("Session {} write side ended: {e}", self.key),
            Err(e) => log::error!("Session {} writer task failed: {e}", self.key),
        }
    }
}

/// Read frames until the peer goes away, hands each one to the dispatcher.
///
/// Returns `Ok(())` on an orderly close and an error for every other exit.
/// Each received frame, keep-alive acknowledgements included, restarts the
/// idle deadline and refreshes the user's presence activity.
///
/// Closing `session` stops the loop only while it waits for the next frame;
/// a dispatch in progress always runs to completion.
pub async fn read_loop<R, E>(
    stream: &mut R,
    session: &SessionHandle,
    dispatcher: &Dispatcher,
    config: &SessionConfig,
) -> Result<(), SessionError>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = session.closed() => return Err(SessionError::Closed),
            next = timeout(config.pong_wait, stream.next()) => next,
        };
        let message = match next {
            Err(_) => return Err(SessionError::IdleTimeout(config.pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(SessionError::Read(e.to_string())),
            Ok(Some(Ok(message))) => message,
        };
        dispatcher.record_activity(session).await;

        match message {
            Message::Text(text) => {
                check_frame_size(text.as_str().len(), config)?;
                dispatcher.dispatch(session, text.as_str()).await;
            }
            Message::Binary(bytes) => {
                check_frame_size(bytes.len(), config)?;
                match std::str::from_utf8(&bytes) {
                    Ok(text) => dispatcher.dispatch(session, text).await,
                    Err(_) => log::debug!("Session {}: dropping non UTF-8 binary frame", session.key()),
                }
            }
            Message::Pong(_) => log::trace!("Session {}: keep-alive acknowledged", session.key()),
            // Answered by the transport.
            Message::Ping(_) => {}
            Message::Close(_) => return Ok(()),
        }
    }
}

fn check_frame_size(size: usize, config: &SessionConfig) -> Result<(), SessionError> {
    if size > config.max_frame_bytes {
        return Err(SessionError::FrameTooLarge {
            size,
            max: config.max_frame_bytes,
        });
    }
    Ok(())
}

/// Drain the outbound queue to the transport and probe the peer periodically.
///
/// Returns `Ok(())` once the queue is closed (after attempting a close frame).
pub async fn write_loop<K>(
    sink: &mut K,
    mut outbound: Outbound,
    config: &SessionConfig,
) -> Result<(), SessionError>
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    let mut keep_alive = interval_at(Instant::now() + config.ping_period, config.ping_period);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    send_with_deadline(sink, Message::text(&*frame), config.write_wait).await?;
                }
                None => {
                    let _ = send_with_deadline(sink, Message::Close(None), config.write_wait).await;
                    return Ok(());
                }
            },
            _ = keep_alive.tick() => {
                send_with_deadline(sink, Message::Ping(Default::default()), config.write_wait).await?;
            }
        }
    }
}

async fn send_with_deadline<K>(sink: &mut K, message: Message, wait: Duration) -> Result<(), SessionError>
where
    K: Sink<Message> + Unpin,
    K::Error: fmt::Display,
{
    match timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Write(e.to_string())),
        Err(_) => Err(SessionError::WriteTimeout(wait)),
    }
}
