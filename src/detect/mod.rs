//! Object detection over cached frames.
//!
//! `DetectionEngine` decodes a frame, normalizes it to the model input, runs a
//! [`DetectorBackend`] and turns candidate rows into labeled boxes in frame
//! pixel coordinates.

mod backend;
mod backends;
mod candidates;
mod engine;
mod labels;
mod result;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::Deserialize;

pub use backend::{DetectorBackend, OutputTensor};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{DetectionEngine, DetectionSettings};
pub use labels::{load_labels, parse_labels};
pub use result::{BoundingBox, DetectionResult};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Which detector backend to load.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Detection unavailable; frames stream without detections.
    #[default]
    None,
    Stub,
    Tract,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::None => "none",
            DetectorKind::Stub => "stub",
            DetectorKind::Tract => "tract",
        }
    }
}

impl FromStr for DetectorKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(DetectorKind::None),
            "stub" => Ok(DetectorKind::Stub),
            "tract" | "onnx" => Ok(DetectorKind::Tract),
            other => Err(anyhow!("unknown detection backend '{}'", other)),
        }
    }
}

/// Plane order of the planar model input.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub confidence_threshold: f32,
    pub backend: DetectorKind,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
    pub input_width: u32,
    pub input_height: u32,
    pub channel_order: ChannelOrder,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.5,
            backend: DetectorKind::None,
            model_path: PathBuf::from("models/yolov11n.onnx"),
            labels_path: PathBuf::from("models/coco.names"),
            input_width: 640,
            input_height: 640,
            channel_order: ChannelOrder::Rgb,
        }
    }
}

// ----------------------------------------------------------------------------
// Engine construction
// ----------------------------------------------------------------------------

impl DetectionEngine {
    /// Build the engine described by `config`.
    ///
    /// A model or labels file that fails to load is logged and yields an
    /// engine without a backend; the server keeps streaming frames.
    pub fn from_config(config: &DetectionConfig) -> Self {
        match config.backend {
            DetectorKind::None => {
                log::info!("detection: no backend configured");
                DetectionEngine::unavailable(config)
            }
            DetectorKind::Stub => {
                let labels = load_labels(&config.labels_path).unwrap_or_else(|err| {
                    log::debug!("detection: stub backend without labels: {:#}", err);
                    Vec::new()
                });
                log::info!("detection: stub backend loaded ({} labels)", labels.len());
                DetectionEngine::new(Box::new(StubBackend::new()), labels, config)
            }
            DetectorKind::Tract => match load_model(config) {
                Ok(engine) => engine,
                Err(err) => {
                    log::error!("detection unavailable: {:#}", err);
                    DetectionEngine::unavailable(config)
                }
            },
        }
    }
}

#[cfg(feature = "backend-tract")]
fn load_model(config: &DetectionConfig) -> Result<DetectionEngine> {
    let labels = load_labels(&config.labels_path)?;
    let mut backend = TractBackend::new(&config.model_path, config.input_width, config.input_height)?;
    if let Err(err) = backend.warm_up(config.input_width, config.input_height) {
        log::warn!("detection: model warm-up failed: {:#}", err);
    }
    log::info!(
        "detection: loaded {} ({} labels, input {}x{})",
        config.model_path.display(),
        labels.len(),
        config.input_width,
        config.input_height
    );
    Ok(DetectionEngine::new(Box::new(backend), labels, config))
}

#[cfg(not(feature = "backend-tract"))]
fn load_model(_config: &DetectionConfig) -> Result<DetectionEngine> {
    Err(anyhow!(
        "detection backend 'tract' requires the backend-tract feature"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_kind_parses_aliases() -> Result<()> {
        assert_eq!("Stub".parse::<DetectorKind>()?, DetectorKind::Stub);
        assert_eq!("onnx".parse::<DetectorKind>()?, DetectorKind::Tract);
        assert_eq!("off".parse::<DetectorKind>()?, DetectorKind::None);
        assert!("yolo".parse::<DetectorKind>().is_err());
        Ok(())
    }

    #[test]
    fn missing_model_leaves_engine_unavailable() {
        let config = DetectionConfig {
            backend: DetectorKind::Tract,
            model_path: PathBuf::from("/nonexistent/model.onnx"),
            labels_path: PathBuf::from("/nonexistent/coco.names"),
            ..DetectionConfig::default()
        };
        let engine = DetectionEngine::from_config(&config);
        assert!(!engine.is_available());
    }

    #[test]
    fn stub_loads_without_labels_file() {
        let config = DetectionConfig {
            backend: DetectorKind::Stub,
            labels_path: PathBuf::from("/nonexistent/coco.names"),
            ..DetectionConfig::default()
        };
        let engine = DetectionEngine::from_config(&config);
        assert!(engine.is_available());
        assert_eq!(engine.backend_name(), "stub");
        assert!(engine.labels().is_empty());
    }
}
