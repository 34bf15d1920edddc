//! JPEG helpers shared by capture backends and the detection engine.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};

/// Encode a packed RGB24 buffer as JPEG.
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let expected = rgb_len(width, height)?;
    if rgb.len() != expected {
        return Err(anyhow!(
            "expected {} RGB bytes for {}x{}, received {}",
            expected,
            width,
            height,
            rgb.len()
        ));
    }
    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .context("encode jpeg")?;
    Ok(out)
}

/// Decode JPEG bytes into an RGB image.
pub fn decode_jpeg(bytes: &[u8]) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(anyhow!("cannot decode an empty frame"));
    }
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
        .context("decode jpeg")?;
    Ok(image.into_rgb8())
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_frame_decodes_to_same_dimensions() -> Result<()> {
        let rgb = vec![90u8; 32 * 24 * 3];
        let jpeg = encode_jpeg(&rgb, 32, 24, 80)?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = decode_jpeg(&jpeg)?;
        assert_eq!(decoded.dimensions(), (32, 24));
        Ok(())
    }

    #[test]
    fn encode_rejects_length_mismatch() {
        assert!(encode_jpeg(&[0u8; 10], 4, 4, 80).is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_jpeg(&[]).is_err());
        assert!(decode_jpeg(b"not a jpeg").is_err());
    }
}
