use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use super::backend::DetectorBackend;
use super::candidates::{decode_candidates, Geometry};
use super::result::DetectionResult;
use super::{ChannelOrder, DetectionConfig};
use crate::codec::decode_jpeg;
use crate::frame::Frame;

// ----------------------------------------------------------------------------
// DetectionSettings: per-call gate
// ----------------------------------------------------------------------------

/// Enable flag and confidence threshold applied to one `process_frame` call.
///
/// The engine keeps a process-wide copy; sessions that control detection per
/// client keep their own and pass it to [`DetectionEngine::process_frame_with`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionSettings {
    pub enabled: bool,
    pub confidence_threshold: f32,
}

impl DetectionSettings {
    pub fn new(enabled: bool, confidence_threshold: f32) -> Self {
        let mut settings = Self {
            enabled,
            confidence_threshold: 0.5,
        };
        settings.set_threshold(confidence_threshold);
        settings
    }

    /// Clamp into `[0, 1]`. Non-finite values are ignored and return false.
    pub fn set_threshold(&mut self, threshold: f32) -> bool {
        if !threshold.is_finite() {
            return false;
        }
        self.confidence_threshold = threshold.clamp(0.0, 1.0);
        true
    }
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.5,
        }
    }
}

// ----------------------------------------------------------------------------
// DetectionEngine
// ----------------------------------------------------------------------------

/// Frame-to-detections transform shared by every session.
///
/// The backend sits behind a mutex so inference calls from concurrent
/// sessions are serialized. Settings are atomics and take effect on the next
/// call. Failures never escape `process_frame`: they are logged and the frame
/// yields no detections.
pub struct DetectionEngine {
    backend: Option<Mutex<Box<dyn DetectorBackend>>>,
    backend_name: &'static str,
    labels: Vec<String>,
    enabled: AtomicBool,
    threshold_bits: AtomicU32,
    input_width: u32,
    input_height: u32,
    channel_order: ChannelOrder,
    failure_streak: AtomicU64,
}

impl DetectionEngine {
    pub fn new(
        backend: Box<dyn DetectorBackend>,
        labels: Vec<String>,
        config: &DetectionConfig,
    ) -> Self {
        let backend_name = backend.name();
        let mut engine = Self::unavailable(config);
        engine.backend = Some(Mutex::new(backend));
        engine.backend_name = backend_name;
        engine.labels = labels;
        engine
    }

    /// Engine with no backend: `process_frame` always returns `[]`.
    pub fn unavailable(config: &DetectionConfig) -> Self {
        let settings = DetectionSettings::new(config.enabled, config.confidence_threshold);
        Self {
            backend: None,
            backend_name: "none",
            labels: Vec::new(),
            enabled: AtomicBool::new(settings.enabled),
            threshold_bits: AtomicU32::new(settings.confidence_threshold.to_bits()),
            input_width: config.input_width,
            input_height: config.input_height,
            channel_order: config.channel_order,
            failure_streak: AtomicU64::new(0),
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Update the shared threshold, clamped into `[0, 1]`.
    pub fn set_confidence_threshold(&self, threshold: f32) {
        let mut settings = self.settings();
        if settings.set_threshold(threshold) {
            self.threshold_bits
                .store(settings.confidence_threshold.to_bits(), Ordering::Relaxed);
        } else {
            log::warn!("ignoring non-finite confidence threshold {}", threshold);
        }
    }

    pub fn settings(&self) -> DetectionSettings {
        DetectionSettings {
            enabled: self.enabled.load(Ordering::Relaxed),
            confidence_threshold: f32::from_bits(self.threshold_bits.load(Ordering::Relaxed)),
        }
    }

    /// Run detection with the engine-wide settings.
    pub fn process_frame(&self, frame: &Frame) -> Vec<DetectionResult> {
        self.process_frame_with(frame, self.settings())
    }

    /// Run detection with caller-supplied settings.
    pub fn process_frame_with(
        &self,
        frame: &Frame,
        settings: DetectionSettings,
    ) -> Vec<DetectionResult> {
        if !settings.enabled || frame.is_empty() {
            return Vec::new();
        }
        let Some(backend) = &self.backend else {
            return Vec::new();
        };

        match self.detect(backend, frame.bytes(), settings.confidence_threshold) {
            Ok(detections) => {
                if self.failure_streak.swap(0, Ordering::Relaxed) > 0 {
                    log::info!("detection recovered on frame {}", frame.seq);
                }
                detections
            }
            Err(err) => {
                if self.failure_streak.fetch_add(1, Ordering::Relaxed) == 0 {
                    log::warn!("detection failed on frame {}: {:#}", frame.seq, err);
                } else {
                    log::debug!("detection failed on frame {}: {:#}", frame.seq, err);
                }
                Vec::new()
            }
        }
    }

    fn detect(
        &self,
        backend: &Mutex<Box<dyn DetectorBackend>>,
        jpeg: &[u8],
        threshold: f32,
    ) -> Result<Vec<DetectionResult>> {
        let image = decode_jpeg(jpeg)?;
        let (frame_width, frame_height) = image.dimensions();
        let input = self.prepare_input(&image);

        let output = {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("detector backend lock poisoned"))?;
            guard.infer(&input, self.input_width, self.input_height)?
        };

        decode_candidates(
            &output,
            threshold,
            Geometry {
                frame_width,
                frame_height,
                input_width: self.input_width,
                input_height: self.input_height,
            },
            &self.labels,
        )
    }

    /// Resize to the model input and lay out as planar `[3, H, W]` in `[0, 1]`.
    fn prepare_input(&self, image: &RgbImage) -> Vec<f32> {
        let resized = imageops::resize(
            image,
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let plane = self.input_width as usize * self.input_height as usize;
        let order = match self.channel_order {
            ChannelOrder::Rgb => [0, 1, 2],
            ChannelOrder::Bgr => [2, 1, 0],
        };

        let mut input = vec![0.0f32; plane * 3];
        for (i, pixel) in resized.pixels().enumerate() {
            for (plane_idx, &channel) in order.iter().enumerate() {
                input[plane_idx * plane + i] = pixel[channel] as f32 / 255.0;
            }
        }
        input
    }
}
