//! Upstream video capture
//!
//! [`GstVideoSource`] joins the multicast RTP/H.264 group, decodes it with
//! GStreamer and hands every appsink sample to the [`ProducerAdapter`] from
//! the streaming thread. Bus messages are read on a dedicated thread and
//! turned into [`SourceEvent`]s.

mod encoder;
pub mod pipeline;

pub use encoder::JpegEncoder;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{EncodeMode, SourceConfig};
use crate::streaming::{EncodedImage, ProducerAdapter, RawImage, Sample, SourceEvent};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("GStreamer error: {0}")]
    Gst(#[from] gst::glib::Error),

    #[error("GStreamer bool error: {0}")]
    GstBool(#[from] gst::glib::BoolError),

    #[error("state change error: {0}")]
    StateChange(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("failed to spawn bus thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("capture already running")]
    AlreadyRunning,

    #[error("stop task failed: {0}")]
    StopTask(#[from] tokio::task::JoinError),
}

/// Something that pushes samples into a [`ProducerAdapter`]
pub trait VideoSource: Send {
    fn start(&mut self, producer: Arc<ProducerAdapter>) -> Result<(), CaptureError>;

    /// Idempotent
    fn stop(&mut self) -> Result<(), CaptureError>;

    fn is_running(&self) -> bool;
}

/// Stop `source` on the blocking pool; stopping a pipeline blocks on
/// GStreamer state changes and the bus thread join.
pub async fn stop_blocking<S>(mut source: S) -> Result<(), CaptureError>
where
    S: VideoSource + 'static,
{
    tokio::task::spawn_blocking(move || source.stop()).await?
}

/// GStreamer multicast H.264 receiver
pub struct GstVideoSource {
    config: SourceConfig,
    pipeline: Option<gst::Pipeline>,
    bus_thread: Option<JoinHandle<()>>,
    is_running: Arc<AtomicBool>,
}

impl GstVideoSource {
    /// `gst::init()` must have been called before [`VideoSource::start`]
    pub fn new(config: SourceConfig) -> Self {
        Self {
            config,
            pipeline: None,
            bus_thread: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_pipeline(&self) -> Result<(gst::Pipeline, gst_app::AppSink), CaptureError> {
        let desc = pipeline::describe(&self.config);
        debug!(pipeline = %desc, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&desc)?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| CaptureError::Pipeline("Not a pipeline".to_string()))?;

        let app_sink = pipeline
            .by_name(pipeline::APPSINK_NAME)
            .ok_or_else(|| CaptureError::Pipeline("No appsink found".to_string()))?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| CaptureError::Pipeline("Not an appsink".to_string()))?;

        Ok((pipeline, app_sink))
    }

    fn spawn_bus_thread(
        &self,
        pipeline: &gst::Pipeline,
        producer: Arc<ProducerAdapter>,
    ) -> Result<JoinHandle<()>, CaptureError> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| CaptureError::Pipeline("Pipeline has no bus".to_string()))?;
        let is_running = Arc::clone(&self.is_running);

        let handle = std::thread::Builder::new()
            .name("gst-bus".to_string())
            .spawn(move || {
                while is_running.load(Ordering::Acquire) {
                    if let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) {
                        handle_bus_message(&msg, &producer);
                    }
                }
            })?;

        Ok(handle)
    }
}

impl VideoSource for GstVideoSource {
    fn start(&mut self, producer: Arc<ProducerAdapter>) -> Result<(), CaptureError> {
        if self.is_running.load(Ordering::Acquire) {
            return Err(CaptureError::AlreadyRunning);
        }

        info!(
            interface = %self.config.interface,
            group = %format!("{}:{}", self.config.multicast_address, self.config.multicast_port),
            quality = self.config.quality,
            scale = self.config.scale,
            encode = ?self.config.encode,
            "Starting video source"
        );

        let (pipeline, app_sink) = self.build_pipeline()?;
        let mode = self.config.encode;
        let is_running = Arc::clone(&self.is_running);
        let sample_producer = Arc::clone(&producer);

        app_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    if !is_running.load(Ordering::Relaxed) {
                        return Ok(gst::FlowSuccess::Ok);
                    }

                    match convert_sample(&sample, mode) {
                        Ok(converted) => {
                            // Encode failures are logged and counted by the producer
                            let _ = sample_producer.on_sample(converted);
                        }
                        Err(e) => warn!(error = %e, "Unusable sample"),
                    }

                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        self.is_running.store(true, Ordering::Release);
        let bus_thread = match self.spawn_bus_thread(&pipeline, producer) {
            Ok(handle) => handle,
            Err(e) => {
                self.is_running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            self.is_running.store(false, Ordering::Release);
            let _ = pipeline.set_state(gst::State::Null);
            let _ = bus_thread.join();
            return Err(CaptureError::StateChange(format!("{:?}", e)));
        }

        self.pipeline = Some(pipeline);
        self.bus_thread = Some(bus_thread);

        info!("Video source started, waiting for stream");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Stopping video source");

        let result = match self.pipeline.take() {
            Some(pipeline) => pipeline
                .set_state(gst::State::Null)
                .map(|_| ())
                .map_err(|e| CaptureError::StateChange(format!("{:?}", e))),
            None => Ok(()),
        };

        if let Some(handle) = self.bus_thread.take() {
            if handle.join().is_err() {
                warn!("Bus thread panicked");
            }
        }

        result
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }
}

impl Drop for GstVideoSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn handle_bus_message(msg: &gst::Message, producer: &ProducerAdapter) {
    use gst::MessageView;

    match msg.view() {
        MessageView::Error(err) => {
            let src = err
                .src()
                .map(|s| s.path_string())
                .unwrap_or_else(|| "unknown".into());
            error!(
                source = %src,
                error = %err.error(),
                debug = ?err.debug(),
                "GStreamer error"
            );
            producer.on_event(SourceEvent::Error(format!("{}: {}", src, err.error())));
        }
        MessageView::Warning(warning) => {
            let src = warning
                .src()
                .map(|s| s.path_string())
                .unwrap_or_else(|| "unknown".into());
            warn!(source = %src, warning = %warning.error(), "GStreamer warning");
        }
        MessageView::StateChanged(sc) => {
            if sc
                .src()
                .and_then(|s| s.downcast_ref::<gst::Pipeline>())
                .is_some()
            {
                debug!(
                    old_state = ?sc.old(),
                    new_state = ?sc.current(),
                    "Pipeline state changed"
                );
            }
        }
        MessageView::Eos(_) => {
            info!("End of stream received");
            producer.on_event(SourceEvent::EndOfStream);
        }
        _ => {}
    }
}

/// Turn one appsink sample into what the producer expects
fn convert_sample(sample: &gst::Sample, mode: EncodeMode) -> Result<Sample, CaptureError> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| CaptureError::Pipeline("sample without buffer".to_string()))?;
    let map = buffer.map_readable()?;
    let caps = sample.caps();

    match mode {
        EncodeMode::Pipeline => {
            let (width, height) = caps
                .and_then(|caps| caps.structure(0))
                .map(|s| (s.get::<i32>("width").ok(), s.get::<i32>("height").ok()))
                .unwrap_or((None, None));

            Ok(Sample::Encoded(EncodedImage {
                data: Bytes::copy_from_slice(map.as_slice()),
                width: width.and_then(|w| u32::try_from(w).ok()),
                height: height.and_then(|h| u32::try_from(h).ok()),
            }))
        }
        EncodeMode::InProcess => {
            let caps = caps.ok_or_else(|| CaptureError::Pipeline("sample without caps".to_string()))?;
            let info = gst_video::VideoInfo::from_caps(caps)?;
            let stride = info.stride().first().copied().unwrap_or(0).max(0) as usize;

            let data = pack_rgb_rows(map.as_slice(), info.width(), info.height(), stride)
                .ok_or_else(|| {
                    CaptureError::Pipeline(format!(
                        "{} byte buffer too small for {}x{} stride {}",
                        map.size(),
                        info.width(),
                        info.height(),
                        stride
                    ))
                })?;

            Ok(Sample::Raw(RawImage {
                data,
                width: info.width(),
                height: info.height(),
            }))
        }
    }
}

/// Copy RGB8 rows out of a possibly padded buffer into a tightly packed one
fn pack_rgb_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Option<Bytes> {
    let row = width as usize * 3;
    let height = height as usize;
    if height == 0 || stride < row {
        return None;
    }

    let needed = stride * (height - 1) + row;
    if data.len() < needed {
        return None;
    }

    if stride == row {
        return Some(Bytes::copy_from_slice(&data[..row * height]));
    }

    let mut packed = Vec::with_capacity(row * height);
    for chunk in data.chunks(stride).take(height) {
        packed.extend_from_slice(&chunk[..row]);
    }
    Some(Bytes::from(packed))
}
