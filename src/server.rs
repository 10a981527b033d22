//! WebSocket listener and session supervision

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::streaming::{ClientSession, RelayContext, SessionSummary, StatusBroadcaster};
use crate::transport::{WebSocketSettings, WebSocketTransport};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Accepts clients and runs one [`ClientSession`] per connection, plus the
/// status broadcaster, until shut down.
pub struct RelayServer {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    settings: WebSocketSettings,
    shutdown_grace: Duration,
}

impl RelayServer {
    /// Bind the listener; port 0 picks an ephemeral port
    pub async fn bind(
        addr: &str,
        ctx: Arc<RelayContext>,
        settings: WebSocketSettings,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            ctx,
            settings,
            shutdown_grace: Duration::from_secs(2),
        })
    }

    /// How long shutdown waits for sessions before aborting them
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }

    /// Serve until `shutdown` resolves, then close every session
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        info!(addr = %self.local_addr()?, "WebSocket server listening");

        let (stop_tx, stop_rx) = watch::channel(false);
        let broadcaster = tokio::spawn(StatusBroadcaster::new(Arc::clone(&self.ctx)).run(stop_rx));

        let mut sessions: JoinSet<Option<SessionSummary>> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "TCP connection accepted");
                        sessions.spawn(Self::handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.ctx),
                            self.settings.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Session task failed");
                    }
                }
            }
        }

        info!(clients = self.ctx.registry.len(), "Shutting down WebSocket server");
        stop_tx.send_replace(true);
        self.ctx.registry.close_all();

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(remaining = sessions.len(), "Sessions did not finish in time, aborting");
            sessions.abort_all();
            while sessions.join_next().await.is_some() {}
        }

        if let Err(e) = broadcaster.await {
            warn!(error = %e, "Status broadcaster task failed");
        }

        info!("WebSocket server stopped");
        Ok(())
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        ctx: Arc<RelayContext>,
        settings: WebSocketSettings,
    ) -> Option<SessionSummary> {
        let transport = match WebSocketTransport::accept(stream, &settings).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(%peer, error = %e, "WebSocket handshake failed");
                return None;
            }
        };

        Some(ClientSession::open(ctx, Arc::new(transport)).run().await)
    }
}
