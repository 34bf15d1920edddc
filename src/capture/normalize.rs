use anyhow::{anyhow, Result};

use crate::codec::rgb_len;

/// Raw pixel layouts a device may settle on when it cannot deliver MJPEG.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    /// Packed 4:2:2, two pixels per `Y0 U Y1 V` quad.
    Yuyv,
    Nv12,
}

/// Convert one raw device buffer into packed RGB24.
pub(crate) fn to_rgb(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            let frame = pixels.get(..expected).ok_or_else(|| {
                anyhow!(
                    "RGB frame too short: expected {}, got {}",
                    expected,
                    pixels.len()
                )
            })?;
            Ok(frame.to_vec())
        }
        PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height),
    }
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let pixel_count = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| anyhow!("YUYV frame dimensions overflow"))?;
    if width % 2 != 0 {
        return Err(anyhow!("YUYV frame width must be even, got {}", width));
    }
    let expected = pixel_count * 2;
    // Drivers hand out whole mmap buffers; only the leading image is used.
    let frame = pixels.get(..expected).ok_or_else(|| {
        anyhow!(
            "YUYV frame too short: expected {}, got {}",
            expected,
            pixels.len()
        )
    })?;

    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for quad in frame.chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        for y in [quad[0], quad[2]] {
            rgb.extend_from_slice(&yuv_to_rgb(y as f32, u, v));
        }
    }
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() < expected {
        return Err(anyhow!(
            "NV12 frame too short: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = Vec::with_capacity(y_plane * 3);
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;
            rgb.extend_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_yuyv_is_gray() -> Result<()> {
        let yuyv = [100u8, 128, 100, 128, 100, 128, 100, 128];
        let rgb = to_rgb(&yuyv, 4, 1, PixelFormat::Yuyv)?;
        assert_eq!(rgb, vec![100u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_ignores_trailing_buffer_padding() -> Result<()> {
        let mut yuyv = vec![128u8; 2 * 2 * 2];
        yuyv.extend_from_slice(&[0u8; 16]);
        let rgb = to_rgb(&yuyv, 2, 2, PixelFormat::Yuyv)?;
        assert_eq!(rgb.len(), 12);
        Ok(())
    }

    #[test]
    fn odd_width_yuyv_is_rejected() {
        assert!(to_rgb(&[0u8; 6], 3, 1, PixelFormat::Yuyv).is_err());
    }

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let rgb = to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn short_rgb_buffer_is_rejected() {
        assert!(to_rgb(&[1u8; 8], 1, 3, PixelFormat::Rgb24).is_err());
    }
}
