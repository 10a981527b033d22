//! Multicast H.264 to WebSocket JPEG bridge
//!
//! This library relays a robot camera's multicast RTP/H.264 stream to any
//! number of WebSocket viewers:
//! - GStreamer receive/decode pipeline feeding a single producer
//! - Latest-wins frame slot: slow viewers skip frames instead of queueing them
//! - One independent delivery loop per viewer
//! - Periodic JSON status (connectivity, fps, viewer count, resolution)
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use video_bridge::streaming::{ProducerAdapter, RelayContext};
//! use video_bridge::transport::WebSocketSettings;
//! use video_bridge::RelayServer;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Arc::new(RelayContext::default());
//! let _producer = ProducerAdapter::new(Arc::clone(&ctx));
//! // hand the producer to a VideoSource; it calls on_sample() per frame
//!
//! let server = RelayServer::bind("0.0.0.0:9000", ctx, WebSocketSettings::default()).await?;
//! server.serve(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod server;
pub mod streaming;
pub mod transport;
pub mod wire;

// Re-exports for convenience
pub use capture::{CaptureError, GstVideoSource, JpegEncoder, VideoSource};
pub use config::{Config, ConfigError, EncodeMode};
pub use server::{RelayServer, ServerError};
pub use streaming::{FrameSlot, ProducerAdapter, RelayContext};
