use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::transport::ClientTransport;

pub type SessionId = u64;

/// Registry's view of one connected client.
///
/// Cheap to clone; the close signal is shared with the owning session loop.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    transport: Arc<dyn ClientTransport>,
    close_tx: Arc<watch::Sender<bool>>,
}

impl SessionHandle {
    /// Create a handle plus the receiver its session loop listens on
    pub fn new(id: SessionId, transport: Arc<dyn ClientTransport>) -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        let handle = Self {
            id,
            transport,
            close_tx: Arc::new(close_tx),
        };
        (handle, close_rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn ClientTransport> {
        &self.transport
    }

    pub fn peer(&self) -> String {
        self.transport.peer()
    }

    /// Ask the owning session loop to finish
    pub fn request_close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn close_requested(&self) -> bool {
        *self.close_tx.borrow()
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("peer", &self.transport.peer())
            .finish()
    }
}

/// Concurrent set of active sessions
pub struct ClientRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    next_id: AtomicU64,
    /// Set by `close_all`; later registrations are closed on arrival
    closing: AtomicBool,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closing: AtomicBool::new(false),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add(&self, handle: SessionHandle) {
        let (total, closing) = {
            let mut sessions = self.sessions.lock();
            sessions.insert(handle.id, handle.clone());
            (sessions.len(), self.closing.load(Ordering::Acquire))
        };
        info!(session_id = handle.id, peer = %handle.peer(), total, "Client registered");

        if closing {
            debug!(session_id = handle.id, "Registered during shutdown, closing");
            handle.request_close();
        }
    }

    /// Remove a session; returns `false` if it was already gone
    pub fn remove(&self, id: SessionId) -> bool {
        let (removed, total) = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&id).is_some();
            (removed, sessions.len())
        };
        if removed {
            info!(session_id = id, total, "Client deregistered");
        }
        removed
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Point-in-time copy of the member list, safe to iterate across awaits
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Signal every registered session to close, and every session
    /// registered from now on
    pub fn close_all(&self) -> usize {
        let sessions = {
            let sessions = self.sessions.lock();
            self.closing.store(true, Ordering::Release);
            sessions.values().cloned().collect::<Vec<_>>()
        };
        for handle in &sessions {
            handle.request_close();
        }
        debug!(count = sessions.len(), "Close requested for all sessions");
        sessions.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
