//! Single-slot latest-frame store shared between the producer and every session.
//!
//! The producer overwrites the slot on each new frame; readers take a cheap
//! `Arc` snapshot. Nothing is ever queued, so a slow reader can only skip
//! frames, never make the producer wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::warn;

/// One encoded image with its identity and capture time.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame counter, starts at 1
    pub id: u64,
    pub captured_at: SystemTime,
    /// Encoded image bytes (JPEG)
    pub payload: Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Frame {
    pub fn new(id: u64, captured_at: SystemTime, payload: Bytes) -> Self {
        Self {
            id,
            captured_at,
            payload,
            width: None,
            height: None,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Capture time as seconds since the Unix epoch
    pub fn timestamp_secs(&self) -> f64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

pub struct FrameSlot {
    latest: RwLock<Option<Arc<Frame>>>,
    version: AtomicU64,
    changed: Notify,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            latest: RwLock::new(None),
            version: AtomicU64::new(0),
            changed: Notify::new(),
        }
    }

    /// Replace the held frame and bump the version.
    ///
    /// Returns `false` (and keeps the current frame) when `frame.id` is not
    /// newer than the current version.
    pub fn set(&self, frame: Frame) -> bool {
        let id = frame.id;
        {
            let mut latest = self.latest.write();
            let current = self.version.load(Ordering::Acquire);
            if id <= current {
                warn!(frame_id = id, current, "Ignoring stale frame");
                return false;
            }
            *latest = Some(Arc::new(frame));
            self.version.store(id, Ordering::Release);
        }

        self.changed.notify_waiters();
        true
    }

    /// Snapshot of the latest frame, `None` before the first frame.
    pub fn get(&self) -> Option<Arc<Frame>> {
        self.latest.read().clone()
    }

    /// Id of the held frame, 0 when empty
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Future resolving on the next successful `set`.
    ///
    /// Callers should `enable()` it before re-checking `version()` so that a
    /// write racing with the check is not missed.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}
