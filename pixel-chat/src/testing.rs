//! Helpers shared by the unit tests.

use std::pin::Pin;
use std::time::Duration;

use axum::extract::ws::Message;
use futures_util::{sink, stream, Sink, Stream};
use tokio::sync::mpsc;

use crate::protocol::ServerEvent;
use crate::session::Outbound;

pub type TestSink = Pin<Box<dyn Sink<Message, Error = String> + Send>>;
pub type TestStream = Pin<Box<dyn Stream<Item = Result<Message, String>> + Send>>;

/// Next frame on a session queue, decoded. Panics after two seconds.
pub async fn next_event(outbound: &mut Outbound) -> ServerEvent {
    let frame = tokio::time::timeout(Duration::from_secs(2), outbound.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbound queue closed");
    ServerEvent::decode(&frame).expect("frame should decode")
}

/// Assert nothing is queued. Callers await `Hub::live_count` first so that
/// every earlier command has been processed.
pub fn assert_quiet(outbound: &mut Outbound) {
    if let Some(frame) = outbound.try_recv() {
        panic!("expected no queued frame, got {frame}");
    }
}

/// A transport write half whose frames land on the returned receiver.
/// Writes fail once the receiver is dropped.
pub fn channel_sink() -> (TestSink, mpsc::UnboundedReceiver<Message>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = sink::unfold(tx, |tx, message: Message| async move {
        tx.send(message).map_err(|_| "transport closed".to_string())?;
        Ok::<_, String>(tx)
    });
    (Box::pin(sink), rx)
}

/// A transport read half fed from the returned sender. Ends when the sender is dropped.
pub fn channel_stream() -> (mpsc::UnboundedSender<Result<Message, String>>, TestStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    });
    (tx, Box::pin(stream))
}
