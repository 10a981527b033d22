//! Video bridge CLI application

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use gstreamer as gst;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use video_bridge::capture::stop_blocking;
use video_bridge::config::{Config, EncodeMode};
use video_bridge::transport::WebSocketSettings;
use video_bridge::{GstVideoSource, JpegEncoder, ProducerAdapter, RelayContext, RelayServer, VideoSource};

#[derive(Parser, Debug)]
#[command(name = "video-bridge")]
#[command(about = "Relay a multicast H.264 camera stream to WebSocket clients as JPEG frames")]
#[command(version)]
struct Cli {
    /// Path to an optional TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Network interface joined to the multicast group (e.g. eth0)
    #[arg(short, long)]
    interface: Option<String>,

    /// WebSocket port
    #[arg(short, long)]
    port: Option<u16>,

    /// JPEG quality (1-100)
    #[arg(short, long)]
    quality: Option<u8>,

    /// Output scale factor (0 < scale <= 1)
    #[arg(short, long)]
    scale: Option<f64>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Encode JPEG in-process instead of inside the GStreamer pipeline
    #[arg(long)]
    in_process: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(interface) = &self.interface {
            config.source.interface = interface.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(quality) = self.quality {
            config.source.quality = quality;
        }
        if let Some(scale) = self.scale {
            config.source.scale = scale;
        }
        if let Some(bind) = &self.bind {
            config.server.bind_address = bind.clone();
        }
        if self.in_process {
            config.source.encode = EncodeMode::InProcess;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("Video bridge starting");

    let mut config = match &cli.config {
        Some(path) => {
            info!(config_path = %path, "Loading configuration");
            Config::load(path).with_context(|| format!("Failed to load {}", path))?
        }
        None => Config::default(),
    };
    cli.apply(&mut config);
    config.validate()?;

    info!(
        interface = %config.source.interface,
        port = config.server.port,
        quality = config.source.quality,
        scale = config.source.scale,
        "Configuration loaded"
    );

    gst::init().context("Failed to initialize GStreamer")?;

    let ctx = Arc::new(RelayContext::from_config(&config.relay));

    let mut producer = ProducerAdapter::new(Arc::clone(&ctx)).with_log_every(config.relay.log_every_frames);
    if config.source.encode == EncodeMode::InProcess {
        producer = producer.with_encoder(
            JpegEncoder::new(config.source.quality).with_scale(config.source.scale),
        );
    }
    let producer = Arc::new(producer);

    let mut source = GstVideoSource::new(config.source.clone());
    source
        .start(Arc::clone(&producer))
        .context("Failed to start video source")?;

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let settings = WebSocketSettings {
        max_message_size: config.server.max_message_size,
    };
    let server = RelayServer::bind(&addr, Arc::clone(&ctx), settings)
        .await?
        .with_shutdown_grace(Duration::from_millis(config.relay.shutdown_grace_ms));

    info!(addr = %addr, "Streaming started, press Ctrl+C to stop");

    // The source is stopped before the server closes its sessions
    server
        .serve(async move {
            shutdown_signal().await;
            if let Err(e) = stop_blocking(source).await {
                warn!(error = %e, "Failed to stop video source cleanly");
            }
        })
        .await?;

    let stats = producer.stats();
    info!(
        frames = stats.frames_produced,
        dropped = stats.frames_dropped,
        "Video bridge stopped"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
