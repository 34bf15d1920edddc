//! Synthetic capture source.
//!
//! Renders a moving test pattern and encodes it as JPEG. It needs no device and
//! is used for demos and tests.

use anyhow::{anyhow, Result};

use super::CaptureConfig;
use crate::codec::encode_jpeg;

const SQUARE_FRACTION: u32 = 5;

pub(crate) struct SyntheticSource {
    config: CaptureConfig,
    frame_count: u64,
    open: bool,
    /// Selects the tint of the pattern so different device ids look different.
    tint: u8,
}

impl SyntheticSource {
    pub(crate) fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            open: false,
            tint: 0,
        }
    }

    /// Synthetic sources are always available.
    pub(crate) fn open(&mut self, device_id: u32) -> Result<()> {
        self.tint = (device_id.wrapping_mul(53) % 256) as u8;
        self.open = true;
        log::info!(
            "SyntheticSource: opened test pattern {}x{} (device {})",
            self.config.width,
            self.config.height,
            device_id
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Vec<u8>> {
        if !self.open {
            return Err(anyhow!("synthetic source not opened"));
        }
        self.frame_count += 1;
        let pixels = self.render();
        encode_jpeg(
            &pixels,
            self.config.width,
            self.config.height,
            self.config.jpeg_quality,
        )
    }

    pub(crate) fn close(&mut self) {
        if self.open {
            log::debug!(
                "SyntheticSource: closed after {} frames",
                self.frame_count
            );
        }
        self.open = false;
    }

    /// Horizontal gradient that drifts over time with a bright square
    /// bouncing across it.
    fn render(&self) -> Vec<u8> {
        let width = self.config.width.max(1);
        let height = self.config.height.max(1);
        let side = (width.min(height) / SQUARE_FRACTION).max(1);
        let travel = (width - side.min(width)).max(1) as u64;
        let phase = self.frame_count % (travel * 2);
        let square_x = (if phase < travel { phase } else { travel * 2 - phase }) as u32;
        let square_y = (height - side.min(height)) / 2;

        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let inside = x >= square_x
                    && x < square_x + side
                    && y >= square_y
                    && y < square_y + side;
                if inside {
                    pixels.extend_from_slice(&[250, 250, 250]);
                } else {
                    let base = ((x as u64 * 255 / width as u64 + self.frame_count) % 256) as u8;
                    pixels.extend_from_slice(&[
                        base,
                        (y * 255 / height) as u8,
                        self.tint.wrapping_add(base / 2),
                    ]);
                }
            }
        }
        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_jpeg;

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            width: 40,
            height: 30,
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn frames_are_decodable_jpeg() -> Result<()> {
        let mut source = SyntheticSource::new(small_config());
        source.open(0)?;
        let jpeg = source.next_frame()?;
        let decoded = decode_jpeg(&jpeg)?;
        assert_eq!(decoded.dimensions(), (40, 30));
        Ok(())
    }

    #[test]
    fn read_before_open_fails() {
        let mut source = SyntheticSource::new(small_config());
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn pattern_moves_between_frames() -> Result<()> {
        let mut source = SyntheticSource::new(small_config());
        source.open(0)?;
        let first = source.render();
        source.frame_count += 1;
        let second = source.render();
        assert_ne!(first, second);
        Ok(())
    }
}
