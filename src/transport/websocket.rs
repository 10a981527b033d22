//! WebSocket transport over `tokio-tungstenite`

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::debug;

use super::{ClientTransport, OutboundMessage, TransportError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Largest accepted message or frame, in bytes
    pub max_message_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            max_message_size: 5 * 1024 * 1024,
        }
    }
}

impl WebSocketSettings {
    fn protocol_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

/// Server side of one WebSocket connection.
///
/// Outgoing messages go through a mutex-guarded sink; a background reader
/// drains incoming traffic (answering pings) and flags the connection closed
/// when the client hangs up.
pub struct WebSocketTransport {
    peer: SocketAddr,
    sink: Mutex<WsSink>,
    closed: Arc<watch::Sender<bool>>,
    reader: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Perform the WebSocket handshake on an accepted TCP stream
    pub async fn accept(
        stream: TcpStream,
        settings: &WebSocketSettings,
    ) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let ws_stream = accept_async_with_config(stream, Some(settings.protocol_config())).await?;
        let (sink, source) = ws_stream.split();

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let reader = tokio::spawn(Self::drain_incoming(source, peer, Arc::clone(&closed)));

        Ok(Self {
            peer,
            sink: Mutex::new(sink),
            closed,
            reader,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    async fn drain_incoming(mut source: WsSource, peer: SocketAddr, closed: Arc<watch::Sender<bool>>) {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Close(frame)) => {
                    debug!(%peer, ?frame, "Client sent close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(%peer, error = %e, "WebSocket read error");
                    break;
                }
            }
        }
        closed.send_replace(true);
    }
}

impl ClientTransport for WebSocketTransport {
    fn send(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let message = match message {
                OutboundMessage::Binary(data) => Message::binary(data),
                OutboundMessage::Text(text) => Message::text(text),
            };

            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(message).await {
                self.closed.send_replace(true);
                return Err(e.into());
            }
            Ok(())
        })
    }

    fn closed(&self) -> BoxFuture<'_, ()> {
        let mut rx = self.closed.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|closed| *closed).await;
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let already_closed = self.closed.send_replace(true);
            if !already_closed {
                let mut sink = self.sink.lock().await;
                if let Err(e) = sink.close().await {
                    debug!(peer = %self.peer, error = %e, "Error while closing WebSocket");
                }
            }
        })
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
