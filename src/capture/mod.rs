//! Frame capture.
//!
//! This module provides the capture contract the rest of the crate relies on:
//! - `CaptureSession`: start a backend on a device, run its production loop on a
//!   dedicated thread, publish encoded frames into a `FrameCache`, stop it.
//! - `CaptureSource`: one backend instance, selected by `BackendKind`.
//!
//! Backends:
//! - Synthetic test pattern (always built)
//! - V4L2 devices (feature: capture-v4l2)
//! - GStreamer `v4l2src` pipelines (feature: capture-gstreamer)
//! - FFmpeg devices or media URLs (feature: capture-ffmpeg)
//!
//! Every backend produces JPEG bytes. Callers only ever hold a
//! `CaptureSession`; backend-specific types stay private to this module.

#[cfg(feature = "capture-ffmpeg")]
mod ffmpeg;
#[cfg(feature = "capture-gstreamer")]
mod gstreamer;
#[cfg(any(feature = "capture-v4l2", test))]
mod normalize;
mod synthetic;
#[cfg(feature = "capture-v4l2")]
mod v4l2;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameCache};

#[cfg(feature = "capture-ffmpeg")]
use ffmpeg::FfmpegSource;
#[cfg(feature = "capture-gstreamer")]
use gstreamer::GstreamerSource;
use synthetic::SyntheticSource;
#[cfg(feature = "capture-v4l2")]
use v4l2::V4l2Source;

/// Capture backend selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Synthetic,
    V4l2,
    Gstreamer,
    Ffmpeg,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Synthetic => "synthetic",
            BackendKind::V4l2 => "v4l2",
            BackendKind::Gstreamer => "gstreamer",
            BackendKind::Ffmpeg => "ffmpeg",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "synthetic" => Ok(BackendKind::Synthetic),
            "v4l2" => Ok(BackendKind::V4l2),
            "gstreamer" | "gst" => Ok(BackendKind::Gstreamer),
            "ffmpeg" => Ok(BackendKind::Ffmpeg),
            other => Err(anyhow!(
                "unknown capture backend '{}'; expected synthetic, v4l2, gstreamer or ffmpeg",
                other
            )),
        }
    }
}

/// Configuration shared by all capture backends.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub backend: BackendKind,
    /// Overrides the `/dev/video{N}` path derived from the device id.
    pub device_path: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Upper bound on production rate. 0 means "as fast as the source delivers".
    pub target_fps: u32,
    pub jpeg_quality: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Synthetic,
            device_path: None,
            width: 640,
            height: 480,
            target_fps: 30,
            jpeg_quality: 80,
        }
    }
}

impl CaptureConfig {
    /// Device node or URL the backend opens for `device_id`.
    pub fn device_for(&self, device_id: u32) -> String {
        self.device_path
            .clone()
            .unwrap_or_else(|| format!("/dev/video{}", device_id))
    }

    fn frame_interval(&self) -> Duration {
        if self.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.target_fps).max(1) as u64)
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.target_fps == 0 {
            2_000
        } else {
            (1000 / self.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

// ----------------------------------------------------------------------------
// CaptureSource: tagged backend variants
// ----------------------------------------------------------------------------

/// One capture backend instance.
///
/// `open` acquires the device, `next_frame` blocks inside the backend's native
/// read and returns one JPEG frame, `close` releases everything. `close` is
/// idempotent and is also run when the source is dropped.
pub struct CaptureSource {
    backend: Backend,
}

enum Backend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "capture-v4l2")]
    V4l2(V4l2Source),
    #[cfg(feature = "capture-gstreamer")]
    Gstreamer(GstreamerSource),
    #[cfg(feature = "capture-ffmpeg")]
    Ffmpeg(FfmpegSource),
}

impl CaptureSource {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let backend = match config.backend {
            BackendKind::Synthetic => Backend::Synthetic(SyntheticSource::new(config)),
            BackendKind::V4l2 => {
                #[cfg(feature = "capture-v4l2")]
                {
                    Backend::V4l2(V4l2Source::new(config))
                }
                #[cfg(not(feature = "capture-v4l2"))]
                {
                    anyhow::bail!("capture backend 'v4l2' requires the capture-v4l2 feature")
                }
            }
            BackendKind::Gstreamer => {
                #[cfg(feature = "capture-gstreamer")]
                {
                    Backend::Gstreamer(GstreamerSource::new(config)?)
                }
                #[cfg(not(feature = "capture-gstreamer"))]
                {
                    anyhow::bail!(
                        "capture backend 'gstreamer' requires the capture-gstreamer feature"
                    )
                }
            }
            BackendKind::Ffmpeg => {
                #[cfg(feature = "capture-ffmpeg")]
                {
                    Backend::Ffmpeg(FfmpegSource::new(config)?)
                }
                #[cfg(not(feature = "capture-ffmpeg"))]
                {
                    anyhow::bail!("capture backend 'ffmpeg' requires the capture-ffmpeg feature")
                }
            }
        };
        Ok(Self { backend })
    }

    pub fn name(&self) -> &'static str {
        match &self.backend {
            Backend::Synthetic(_) => "synthetic",
            #[cfg(feature = "capture-v4l2")]
            Backend::V4l2(_) => "v4l2",
            #[cfg(feature = "capture-gstreamer")]
            Backend::Gstreamer(_) => "gstreamer",
            #[cfg(feature = "capture-ffmpeg")]
            Backend::Ffmpeg(_) => "ffmpeg",
        }
    }

    pub fn open(&mut self, device_id: u32) -> Result<()> {
        match &mut self.backend {
            Backend::Synthetic(source) => source.open(device_id),
            #[cfg(feature = "capture-v4l2")]
            Backend::V4l2(source) => source.open(device_id),
            #[cfg(feature = "capture-gstreamer")]
            Backend::Gstreamer(source) => source.open(device_id),
            #[cfg(feature = "capture-ffmpeg")]
            Backend::Ffmpeg(source) => source.open(device_id),
        }
    }

    pub fn next_frame(&mut self) -> Result<Vec<u8>> {
        match &mut self.backend {
            Backend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "capture-v4l2")]
            Backend::V4l2(source) => source.next_frame(),
            #[cfg(feature = "capture-gstreamer")]
            Backend::Gstreamer(source) => source.next_frame(),
            #[cfg(feature = "capture-ffmpeg")]
            Backend::Ffmpeg(source) => source.next_frame(),
        }
    }

    pub fn close(&mut self) {
        match &mut self.backend {
            Backend::Synthetic(source) => source.close(),
            #[cfg(feature = "capture-v4l2")]
            Backend::V4l2(source) => source.close(),
            #[cfg(feature = "capture-gstreamer")]
            Backend::Gstreamer(source) => source.close(),
            #[cfg(feature = "capture-ffmpeg")]
            Backend::Ffmpeg(source) => source.close(),
        }
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.close();
    }
}

// ----------------------------------------------------------------------------
// CaptureSession: producer thread around one source
// ----------------------------------------------------------------------------

/// Snapshot of capture counters.
#[derive(Clone, Debug)]
pub struct CaptureStats {
    pub backend: &'static str,
    pub device: Option<String>,
    pub running: bool,
    pub frames_captured: u64,
    pub read_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    read_errors: AtomicU64,
    last_frame_at: Mutex<Option<Instant>>,
}

impl Counters {
    fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_frame_at.lock() {
            *last = Some(Instant::now());
        }
    }

    fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at.lock().ok().and_then(|last| *last)
    }
}

/// Running state of one capture backend, from `start` to `stop`.
///
/// The production loop runs on its own thread and writes into the shared
/// `FrameCache`. Cancellation is cooperative: `stop` clears the running flag,
/// joins the thread and closes the source. Dropping the session stops it.
pub struct CaptureSession {
    config: CaptureConfig,
    cache: Arc<FrameCache>,
    source: Option<CaptureSource>,
    backend_name: &'static str,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<CaptureSource>>,
    counters: Arc<Counters>,
    device: Option<String>,
    started_at: Option<Instant>,
}

impl CaptureSession {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        Self::with_cache(config, Arc::new(FrameCache::new()))
    }

    /// Build a session that publishes into an existing cache.
    pub fn with_cache(config: CaptureConfig, cache: Arc<FrameCache>) -> Result<Self> {
        let source = CaptureSource::new(config.clone())?;
        Ok(Self {
            backend_name: source.name(),
            config,
            cache,
            source: Some(source),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            counters: Arc::new(Counters::default()),
            device: None,
            started_at: None,
        })
    }

    /// Open the device and start the production loop.
    ///
    /// Expected failures (missing or busy device, unsupported format) come back
    /// as `Err`; nothing is left open when this fails.
    pub fn start(&mut self, device_id: u32) -> Result<()> {
        if self.worker.is_some() {
            return Err(anyhow!("capture session is already running"));
        }
        let mut source = self
            .source
            .take()
            .ok_or_else(|| anyhow!("capture source was lost by a previous worker"))?;
        let device = self.config.device_for(device_id);

        if let Err(err) = source.open(device_id) {
            source.close();
            self.source = Some(source);
            return Err(err.context(format!(
                "start {} capture on {}",
                self.backend_name, device
            )));
        }

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let cache = Arc::clone(&self.cache);
        let counters = Arc::clone(&self.counters);
        let interval = self.config.frame_interval();
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", self.backend_name))
            .spawn(move || run_production_loop(source, cache, running, counters, interval));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(anyhow::Error::new(err).context("spawn capture thread"));
            }
        };

        log::info!(
            "capture started: backend={} device={} {}x{} @{}fps",
            self.backend_name,
            device,
            self.config.width,
            self.config.height,
            self.config.target_fps
        );
        self.worker = Some(worker);
        self.device = Some(device);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    /// Signal the production loop, join it and release the source.
    ///
    /// Safe to call any number of times, including from `Drop`.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.join() {
            Ok(mut source) => {
                source.close();
                self.source = Some(source);
            }
            Err(_) => log::error!("capture thread panicked; source dropped"),
        }
        self.started_at = None;
        log::info!(
            "capture stopped: backend={} frames={}",
            self.backend_name,
            self.counters.frames.load(Ordering::Relaxed)
        );
    }

    /// Non-blocking read of the most recent frame.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.cache.read()
    }

    pub fn cache(&self) -> Arc<FrameCache> {
        Arc::clone(&self.cache)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// True while frames keep arriving within the backend's grace window.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match (self.counters.last_frame_at(), self.started_at) {
            (Some(last), _) => last.elapsed() <= self.config.health_grace(),
            (None, Some(started)) => started.elapsed() <= Duration::from_secs(5),
            (None, None) => false,
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            backend: self.backend_name,
            device: self.device.clone(),
            running: self.is_running(),
            frames_captured: self.counters.frames.load(Ordering::Relaxed),
            read_errors: self.counters.read_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_production_loop(
    mut source: CaptureSource,
    cache: Arc<FrameCache>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    interval: Duration,
) -> CaptureSource {
    let mut failure_streak = 0u64;
    while running.load(Ordering::SeqCst) {
        let cycle_start = Instant::now();
        match source.next_frame() {
            Ok(jpeg) => {
                if cache.write(jpeg).is_some() {
                    counters.record_frame();
                }
                if failure_streak > 0 {
                    log::info!(
                        "capture recovered after {} failed reads ({})",
                        failure_streak,
                        source.name()
                    );
                    failure_streak = 0;
                }
            }
            Err(err) => {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                if failure_streak == 0 {
                    log::warn!("capture read failed ({}): {:#}", source.name(), err);
                }
                failure_streak += 1;
            }
        }

        let elapsed = cycle_start.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
    source
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_config() -> CaptureConfig {
        CaptureConfig {
            width: 64,
            height: 48,
            target_fps: 100,
            ..CaptureConfig::default()
        }
    }

    fn wait_for_frame(session: &CaptureSession) -> Option<Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(frame) = session.latest_frame() {
                return Some(frame);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn backend_kind_parses_aliases() -> Result<()> {
        assert_eq!("V4L2".parse::<BackendKind>()?, BackendKind::V4l2);
        assert_eq!("gst".parse::<BackendKind>()?, BackendKind::Gstreamer);
        assert!("webcam".parse::<BackendKind>().is_err());
        Ok(())
    }

    #[test]
    fn device_path_defaults_to_video_node() {
        let mut config = CaptureConfig::default();
        assert_eq!(config.device_for(2), "/dev/video2");
        config.device_path = Some("/dev/custom".to_string());
        assert_eq!(config.device_for(2), "/dev/custom");
    }

    #[test]
    fn no_frame_before_start() -> Result<()> {
        let session = CaptureSession::new(synthetic_config())?;
        assert!(session.latest_frame().is_none());
        assert!(!session.is_running());
        assert!(!session.is_healthy());
        Ok(())
    }

    #[test]
    fn session_publishes_increasing_sequence_numbers() -> Result<()> {
        let mut session = CaptureSession::new(synthetic_config())?;
        session.start(0)?;

        let first = wait_for_frame(&session).expect("first frame");
        assert_eq!(&first.bytes()[..2], &[0xFF, 0xD8]);
        std::thread::sleep(Duration::from_millis(50));
        let later = session.latest_frame().expect("later frame");
        assert!(later.seq >= first.seq);
        assert!(session.is_healthy());

        session.stop();
        assert!(session.stats().frames_captured >= 1);
        Ok(())
    }

    #[test]
    fn stop_is_idempotent_and_session_restarts() -> Result<()> {
        let mut session = CaptureSession::new(synthetic_config())?;
        session.start(0)?;
        wait_for_frame(&session).expect("frame");

        session.stop();
        session.stop();
        assert!(!session.is_running());

        let seq_after_stop = session.cache().latest_seq();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(session.cache().latest_seq(), seq_after_stop);

        session.start(1)?;
        assert!(session.is_running());
        assert_eq!(session.stats().device.as_deref(), Some("/dev/video1"));
        Ok(())
    }

    #[test]
    fn start_twice_is_rejected() -> Result<()> {
        let mut session = CaptureSession::new(synthetic_config())?;
        session.start(0)?;
        assert!(session.start(0).is_err());
        Ok(())
    }

    #[cfg(not(feature = "capture-v4l2"))]
    #[test]
    fn disabled_backend_is_reported_at_construction() {
        let config = CaptureConfig {
            backend: BackendKind::V4l2,
            ..CaptureConfig::default()
        };
        assert!(CaptureSession::new(config).is_err());
    }
}
