use std::time::Duration;

use parking_lot::RwLock;

use super::fps::FpsEstimator;
use super::frame_slot::FrameSlot;
use super::registry::ClientRegistry;
use crate::config::RelayConfig;
use crate::wire::StatusMessage;

/// Producer-side view of upstream video health
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Connectivity {
    pub connected: bool,
    /// Why the source last went down; cleared on reconnect
    pub last_error: Option<String>,
}

/// Tunables the serving domain reads from the shared context
#[derive(Debug, Clone)]
pub struct RelayTiming {
    pub poll_interval: Duration,
    pub status_interval: Duration,
    pub status_send_timeout: Duration,
}

impl Default for RelayTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            status_interval: Duration::from_secs(1),
            status_send_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything the producer and the serving domain share.
///
/// Built once at startup and handed out as `Arc<RelayContext>`; each piece
/// guards itself and no lock is held across component boundaries.
pub struct RelayContext {
    pub slot: FrameSlot,
    pub fps: FpsEstimator,
    pub registry: ClientRegistry,
    connectivity: RwLock<Connectivity>,
    timing: RelayTiming,
}

impl RelayContext {
    pub fn new(fps_window: usize, timing: RelayTiming) -> Self {
        Self {
            slot: FrameSlot::new(),
            fps: FpsEstimator::new(fps_window),
            registry: ClientRegistry::new(),
            connectivity: RwLock::new(Connectivity::default()),
            timing,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(
            config.fps_window,
            RelayTiming {
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                status_interval: Duration::from_millis(config.status_interval_ms),
                status_send_timeout: Duration::from_millis(config.status_send_timeout_ms),
            },
        )
    }

    pub fn timing(&self) -> &RelayTiming {
        &self.timing
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connectivity.read().connected
    }

    /// Mark the source connected; returns `true` on a transition
    pub fn mark_connected(&self) -> bool {
        // Hot path: one read lock per frame once connected
        if self.connectivity.read().connected {
            return false;
        }
        let mut state = self.connectivity.write();
        let changed = !state.connected;
        state.connected = true;
        state.last_error = None;
        changed
    }

    /// Mark the source disconnected; returns `true` on a transition
    pub fn mark_disconnected(&self, reason: impl Into<String>) -> bool {
        let mut state = self.connectivity.write();
        let changed = state.connected;
        state.connected = false;
        state.last_error = Some(reason.into());
        changed
    }

    /// Resolution of the most recent frame, if known
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.slot.get().and_then(|frame| frame.dimensions())
    }

    pub fn status(&self) -> StatusMessage {
        StatusMessage::new(
            self.is_connected(),
            self.fps.rate(),
            self.registry.len(),
            self.dimensions(),
        )
    }
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::new(super::fps::DEFAULT_WINDOW, RelayTiming::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::Frame;
    use bytes::Bytes;
    use std::time::SystemTime;

    #[test]
    fn test_connectivity_transitions() {
        let ctx = RelayContext::default();
        assert!(!ctx.is_connected());

        assert!(ctx.mark_connected());
        assert!(!ctx.mark_connected());
        assert!(ctx.is_connected());

        assert!(ctx.mark_disconnected("end of stream"));
        assert!(!ctx.mark_disconnected("again"));

        let state = ctx.connectivity();
        assert!(!state.connected);
        assert_eq!(state.last_error.as_deref(), Some("again"));

        // Reconnecting clears the stale error
        assert!(ctx.mark_connected());
        let state = ctx.connectivity();
        assert!(state.connected);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_status_reflects_state() {
        let ctx = RelayContext::default();
        let status = ctx.status();
        assert!(!status.connected);
        assert_eq!(status.clients, 0);
        assert_eq!(status.width, None);

        ctx.slot.set(
            Frame::new(1, SystemTime::now(), Bytes::from_static(b"jpeg")).with_dimensions(640, 360),
        );
        ctx.mark_connected();

        let status = ctx.status();
        assert!(status.connected);
        assert_eq!(status.width, Some(640));
        assert_eq!(status.height, Some(360));
    }
}
