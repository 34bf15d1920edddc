use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{BackendKind, CaptureConfig};
use crate::detect::{ChannelOrder, DetectionConfig, DetectorKind};
use crate::server::ServerConfig;
use crate::session::{ControlScope, SessionConfig};

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_MAX_SESSIONS: usize = 8;
const DEFAULT_QUEUE_DEPTH: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 30;
const DEFAULT_RECV_TIMEOUT_MS: u64 = 5;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FramecastConfigFile {
    server: Option<ServerConfigFile>,
    capture: Option<CaptureConfigFile>,
    detection: Option<DetectionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ServerConfigFile {
    addr: Option<String>,
    max_sessions: Option<usize>,
    queue_depth: Option<usize>,
    poll_interval_ms: Option<u64>,
    recv_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    control_scope: Option<ControlScope>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    backend: Option<String>,
    device_id: Option<u32>,
    device_path: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    jpeg_quality: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    enabled: Option<bool>,
    confidence_threshold: Option<f32>,
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    channel_order: Option<ChannelOrder>,
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct FramecastConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub device_id: u32,
    pub detection: DetectionConfig,
}

impl Default for FramecastConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
            device_id: 0,
            detection: DetectionConfig::default(),
        }
    }
}

impl FramecastConfig {
    /// Load from the file named by `FRAMECAST_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FRAMECAST_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Same as [`FramecastConfig::load`] with an explicit file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => FramecastConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FramecastConfigFile) -> Result<Self> {
        let server = file.server.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let defaults = Self::default();

        let capture_backend = match capture.backend.as_deref() {
            Some(name) => name.parse::<BackendKind>()?,
            None => defaults.capture.backend,
        };
        let detection_backend = match detection.backend.as_deref() {
            Some(name) => name.parse::<DetectorKind>()?,
            None => defaults.detection.backend,
        };
        let jpeg_quality = capture
            .jpeg_quality
            .unwrap_or(defaults.capture.jpeg_quality as u32);
        if !(1..=100).contains(&jpeg_quality) {
            return Err(anyhow!(
                "capture.jpeg_quality must be within 1..=100, got {}",
                jpeg_quality
            ));
        }

        Ok(Self {
            server: ServerConfig {
                addr: server.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
                max_sessions: server.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
                queue_depth: server.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
                session: SessionConfig {
                    poll_interval: Duration::from_millis(
                        server.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                    ),
                    control_scope: server.control_scope.unwrap_or_default(),
                },
                recv_timeout: Duration::from_millis(
                    server.recv_timeout_ms.unwrap_or(DEFAULT_RECV_TIMEOUT_MS),
                ),
                write_timeout: Duration::from_millis(
                    server.write_timeout_ms.unwrap_or(DEFAULT_WRITE_TIMEOUT_MS),
                ),
            },
            capture: CaptureConfig {
                backend: capture_backend,
                device_path: capture.device_path,
                width: capture.width.unwrap_or(defaults.capture.width),
                height: capture.height.unwrap_or(defaults.capture.height),
                target_fps: capture.target_fps.unwrap_or(defaults.capture.target_fps),
                jpeg_quality: jpeg_quality as u8,
            },
            device_id: capture.device_id.unwrap_or(defaults.device_id),
            detection: DetectionConfig {
                enabled: detection.enabled.unwrap_or(defaults.detection.enabled),
                confidence_threshold: detection
                    .confidence_threshold
                    .unwrap_or(defaults.detection.confidence_threshold),
                backend: detection_backend,
                model_path: detection
                    .model_path
                    .unwrap_or(defaults.detection.model_path),
                labels_path: detection
                    .labels_path
                    .unwrap_or(defaults.detection.labels_path),
                input_width: detection
                    .input_width
                    .unwrap_or(defaults.detection.input_width),
                input_height: detection
                    .input_height
                    .unwrap_or(defaults.detection.input_height),
                channel_order: detection.channel_order.unwrap_or_default(),
            },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("FRAMECAST_ADDR") {
            self.server.addr = addr;
        }
        if let Some(backend) = env_value("FRAMECAST_CAPTURE_BACKEND") {
            self.capture.backend = backend
                .parse()
                .context("FRAMECAST_CAPTURE_BACKEND")?;
        }
        if let Some(device_id) = env_value("FRAMECAST_DEVICE_ID") {
            self.device_id = device_id
                .parse()
                .map_err(|_| anyhow!("FRAMECAST_DEVICE_ID must be a non-negative integer"))?;
        }
        if let Some(path) = env_value("FRAMECAST_DEVICE_PATH") {
            self.capture.device_path = Some(path);
        }
        if let Some(backend) = env_value("FRAMECAST_DETECTION_BACKEND") {
            self.detection.backend = backend
                .parse()
                .context("FRAMECAST_DETECTION_BACKEND")?;
        }
        if let Some(path) = env_value("FRAMECAST_MODEL_PATH") {
            self.detection.model_path = PathBuf::from(path);
        }
        if let Some(path) = env_value("FRAMECAST_LABELS_PATH") {
            self.detection.labels_path = PathBuf::from(path);
        }
        if let Some(threshold) = env_value("FRAMECAST_CONFIDENCE") {
            self.detection.confidence_threshold = threshold
                .parse()
                .map_err(|_| anyhow!("FRAMECAST_CONFIDENCE must be a number in [0, 1]"))?;
        }
        if let Some(max_sessions) = env_value("FRAMECAST_MAX_SESSIONS") {
            self.server.max_sessions = max_sessions
                .parse()
                .map_err(|_| anyhow!("FRAMECAST_MAX_SESSIONS must be a positive integer"))?;
        }
        Ok(())
    }

    /// Check cross-field constraints. Called again after command-line overrides.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "detection.confidence_threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if self.server.max_sessions == 0 {
            return Err(anyhow!("server.max_sessions must be at least 1"));
        }
        if self.server.queue_depth == 0 {
            return Err(anyhow!("server.queue_depth must be at least 1"));
        }
        if self.server.session.poll_interval.is_zero() {
            return Err(anyhow!("server.poll_interval_ms must be at least 1"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be non-zero"));
        }
        if self.detection.input_width == 0 || self.detection.input_height == 0 {
            return Err(anyhow!("detection input width and height must be non-zero"));
        }
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!("capture.jpeg_quality must be within 1..=100"));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_config_file(path: &Path) -> Result<FramecastConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
}
