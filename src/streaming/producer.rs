//! Producer adapter: the only writer of the shared frame slot.
//!
//! Called synchronously from the video source's own thread for every sample,
//! so every path here is bounded: encode at most once, swap the slot, record
//! a timestamp, return.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::context::RelayContext;
use super::frame_slot::Frame;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("raw buffer is {actual} bytes, expected {expected} for {width}x{height} RGB")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("invalid dimensions {0}x{1}")]
    Dimensions(u32, u32),

    #[error("JPEG encoding failed: {0}")]
    Jpeg(String),

    #[error("raw sample received but no encoder is configured")]
    NoEncoder,
}

/// Already-compressed image bytes
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Tightly packed RGB8 pixels
#[derive(Debug, Clone)]
pub struct RawImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
}

/// What the video source hands over per sample
#[derive(Debug, Clone)]
pub enum Sample {
    Encoded(EncodedImage),
    Raw(RawImage),
}

/// Connectivity transitions reported by the video source
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    Connected,
    Error(String),
    EndOfStream,
}

/// Turns raw pixels into wire image bytes
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, raw: &RawImage) -> Result<EncodedImage, EncodeError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProducerStats {
    pub frames_produced: u64,
    pub frames_dropped: u64,
}

pub struct ProducerAdapter {
    ctx: Arc<RelayContext>,
    encoder: Option<Box<dyn FrameEncoder>>,
    last_id: AtomicU64,
    frames_dropped: AtomicU64,
    origin: Instant,
    log_every: u64,
}

impl ProducerAdapter {
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            ctx,
            encoder: None,
            last_id: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            origin: Instant::now(),
            log_every: 60,
        }
    }

    pub fn with_encoder(mut self, encoder: impl FrameEncoder + 'static) -> Self {
        self.encoder = Some(Box::new(encoder));
        self
    }

    /// Log a stats line every `frames` frames (0 disables)
    pub fn with_log_every(mut self, frames: u64) -> Self {
        self.log_every = frames;
        self
    }

    /// Publish one sample as the newest frame.
    ///
    /// On encode failure the sample is dropped: the frame id does not
    /// advance and the slot keeps its previous frame.
    pub fn on_sample(&self, sample: Sample) -> Result<u64, EncodeError> {
        let image = match sample {
            Sample::Encoded(image) => image,
            Sample::Raw(raw) => match self.encode(&raw) {
                Ok(image) => image,
                Err(e) => {
                    let dropped = self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(error = %e, dropped, "Dropping sample");
                    return Err(e);
                }
            },
        };

        let id = self.last_id.load(Ordering::Acquire) + 1;
        let payload_len = image.data.len();
        let mut frame = Frame::new(id, SystemTime::now(), image.data);
        frame.width = image.width;
        frame.height = image.height;

        self.ctx.slot.set(frame);
        self.last_id.store(id, Ordering::Release);
        self.ctx.fps.record(self.origin.elapsed().as_secs_f64());

        if self.ctx.mark_connected() {
            info!(frame_id = id, "Video source connected");
        }

        if self.log_every > 0 && id % self.log_every == 0 {
            info!(
                frame_id = id,
                jpeg_kib = payload_len / 1024,
                width = ?image.width,
                height = ?image.height,
                fps = %format!("{:.1}", self.ctx.fps.rate()),
                "Video"
            );
        }

        Ok(id)
    }

    fn encode(&self, raw: &RawImage) -> Result<EncodedImage, EncodeError> {
        let encoder = self.encoder.as_ref().ok_or(EncodeError::NoEncoder)?;
        encoder.encode(raw)
    }

    /// Reflect a source lifecycle event into the shared connectivity state.
    /// The last good frame stays in the slot.
    pub fn on_event(&self, event: SourceEvent) {
        match event {
            SourceEvent::Connected => {
                if self.ctx.mark_connected() {
                    info!("Video source connected");
                }
            }
            SourceEvent::Error(reason) => {
                if self.ctx.mark_disconnected(reason.clone()) {
                    warn!(reason = %reason, "Video source disconnected");
                } else {
                    debug!(reason = %reason, "Video source error while disconnected");
                }
            }
            SourceEvent::EndOfStream => {
                if self.ctx.mark_disconnected("end of stream") {
                    warn!("Video source reached end of stream");
                }
            }
        }
    }

    pub fn last_frame_id(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ProducerStats {
        ProducerStats {
            frames_produced: self.last_frame_id(),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn context(&self) -> &Arc<RelayContext> {
        &self.ctx
    }
}
