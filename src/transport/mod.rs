//! Client transports
//!
//! A transport is one consumer's duplex channel: it accepts whole messages,
//! and reports when the remote side has gone away. Sessions and the status
//! broadcaster only ever talk to `dyn ClientTransport`.

mod websocket;

pub use websocket::{WebSocketSettings, WebSocketTransport};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("send timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One transport-level message; message boundaries are preserved end to end
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Binary(Bytes),
    Text(String),
}

impl OutboundMessage {
    pub fn len(&self) -> usize {
        match self {
            OutboundMessage::Binary(data) => data.len(),
            OutboundMessage::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait ClientTransport: Send + Sync {
    /// Send one message. Concurrent calls are serialized by the transport.
    fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Resolves once the connection is known to be closed
    fn closed(&self) -> BoxFuture<'_, ()>;

    fn is_closed(&self) -> bool;

    /// Best-effort orderly close
    fn close(&self) -> BoxFuture<'_, ()>;

    /// Remote identifier for logging
    fn peer(&self) -> String;
}
