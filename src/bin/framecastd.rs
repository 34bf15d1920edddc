//! framecastd - capture, detect and stream to WebSocket viewers
//!
//! Exit codes: 0 on a clean shutdown (Ctrl-C), 1 when the capture device
//! cannot be started or the listening socket cannot be bound.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use framecast::{BackendKind, CaptureSession, DetectionEngine, FramecastConfig, Server};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long, env = "FRAMECAST_CONFIG")]
    config: Option<PathBuf>,
    /// Listen address (host:port).
    #[arg(long, env = "FRAMECAST_ADDR")]
    addr: Option<String>,
    /// Capture backend (synthetic|v4l2|gstreamer|ffmpeg).
    #[arg(long, env = "FRAMECAST_CAPTURE_BACKEND", value_name = "BACKEND")]
    capture_backend: Option<BackendKind>,
    /// Capture device index (/dev/videoN).
    #[arg(long, env = "FRAMECAST_DEVICE_ID")]
    device_id: Option<u32>,
    /// ONNX model path.
    #[arg(long, env = "FRAMECAST_MODEL_PATH")]
    model: Option<PathBuf>,
    /// Class names file.
    #[arg(long, env = "FRAMECAST_LABELS_PATH")]
    labels: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = FramecastConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        cfg.server.addr = addr;
    }
    if let Some(backend) = args.capture_backend {
        cfg.capture.backend = backend;
    }
    if let Some(device_id) = args.device_id {
        cfg.device_id = device_id;
    }
    if let Some(model) = args.model {
        cfg.detection.model_path = model;
    }
    if let Some(labels) = args.labels {
        cfg.detection.labels_path = labels;
    }
    cfg.validate()?;

    let mut capture = CaptureSession::new(cfg.capture.clone())?;
    capture
        .start(cfg.device_id)
        .with_context(|| format!("failed to start {} capture", cfg.capture.backend))?;

    let engine = Arc::new(DetectionEngine::from_config(&cfg.detection));
    let server = Server::new(cfg.server.clone(), capture.cache(), engine).start()?;
    log::info!(
        "framecastd {} serving http://{}/",
        env!("CARGO_PKG_VERSION"),
        server.addr
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    loop {
        match rx.recv_timeout(HEALTH_LOG_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let stats = capture.stats();
                log::info!(
                    "capture {}: {} frames, {} read errors, healthy={}; {} viewers",
                    stats.backend,
                    stats.frames_captured,
                    stats.read_errors,
                    capture.is_healthy(),
                    server.active_sessions()
                );
            }
        }
    }

    log::info!("shutdown signal received, stopping server and capture...");
    server.stop()?;
    capture.stop();
    Ok(())
}
