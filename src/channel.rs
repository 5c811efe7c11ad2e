//! The duplex event channel a session runs over.
//!
//! Sessions only see a boxed [`EventSink`] and [`EventStream`]; the
//! WebSocket adapters in `server` and `client` and the in-memory pair
//! below all produce these.

use std::pin::Pin;

use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;

use crate::protocol::Event;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unexpected binary message ({0} bytes)")]
    UnexpectedBinary(usize),

    #[error("channel closed")]
    Closed,
}

pub type EventSink = Pin<Box<dyn Sink<Event, Error = ChannelError> + Send>>;
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, ChannelError>> + Send>>;

/// One end of an in-memory duplex channel.
pub struct MemoryEnd {
    pub sink: EventSink,
    pub stream: EventStream,
}

/// Build two connected in-memory ends. Closing one end's sink ends the
/// other end's stream, which is how a disconnect looks to a session.
pub fn memory_pair() -> (MemoryEnd, MemoryEnd) {
    let (a_tx, b_rx) = mpsc::unbounded::<Event>();
    let (b_tx, a_rx) = mpsc::unbounded::<Event>();
    (memory_end(a_tx, a_rx), memory_end(b_tx, b_rx))
}

fn memory_end(tx: mpsc::UnboundedSender<Event>, rx: mpsc::UnboundedReceiver<Event>) -> MemoryEnd {
    MemoryEnd {
        sink: Box::pin(tx.sink_map_err(|_| ChannelError::Closed)),
        stream: Box::pin(rx.map(Ok::<Event, ChannelError>)),
    }
}
