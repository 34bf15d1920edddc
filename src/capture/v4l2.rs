//! V4L2 capture source.
//!
//! Opens a local device node (e.g. /dev/video0) and streams through mmap'd
//! driver buffers. MJPEG is requested first and passed through untouched; if
//! the driver settles on a raw layout the frame is converted to RGB and encoded
//! to JPEG here.
//!
//! The device handle and the buffer mapping live together in one
//! self-referencing state value. Dropping it unmaps the buffers and closes the
//! descriptor, so every exit path (including a failed `open`) releases them.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;

use super::normalize::{to_rgb, PixelFormat};
use super::CaptureConfig;
use crate::codec::encode_jpeg;

const BUFFER_COUNT: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WireFormat {
    Mjpeg,
    Raw(PixelFormat),
}

pub(crate) struct V4l2Source {
    config: CaptureConfig,
    state: Option<V4l2State>,
    format: WireFormat,
    active_width: u32,
    active_height: u32,
    device: String,
}

#[self_referencing]
struct V4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub(crate) fn new(config: CaptureConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: WireFormat::Mjpeg,
            device: String::new(),
        }
    }

    pub(crate) fn open(&mut self, device_id: u32) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.close();
        self.device = self.config.device_for(device_id);

        let mut device = v4l::Device::with_path(&self.device)
            .with_context(|| format!("open v4l2 device {}", self.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"MJPG");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set MJPEG on {}: {}",
                    self.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = match &format.fourcc.repr {
            b"MJPG" => WireFormat::Mjpeg,
            b"YUYV" => WireFormat::Raw(PixelFormat::Yuyv),
            b"RGB3" => WireFormat::Raw(PixelFormat::Rgb24),
            b"NV12" => WireFormat::Raw(PixelFormat::Nv12),
            other => {
                return Err(anyhow!(
                    "v4l2 device {} settled on unsupported pixel format {}",
                    self.device,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", self.device, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;

        let state = V4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: opened {} ({}x{}, {:?})",
            self.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Vec<u8>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not opened")?;
        let raw = state.with_mut(|fields| -> Result<Vec<u8>> {
            let (buf, meta) = fields.stream.next().context("capture v4l2 frame")?;
            let used = (meta.bytesused as usize).min(buf.len());
            Ok(buf[..used].to_vec())
        })?;

        match self.format {
            WireFormat::Mjpeg => {
                if raw.len() < 2 || raw[..2] != [0xFF, 0xD8] {
                    return Err(anyhow!("v4l2 buffer is not a JPEG frame"));
                }
                Ok(raw)
            }
            WireFormat::Raw(pixel_format) => {
                let rgb = to_rgb(&raw, self.active_width, self.active_height, pixel_format)?;
                encode_jpeg(
                    &rgb,
                    self.active_width,
                    self.active_height,
                    self.config.jpeg_quality,
                )
            }
        }
    }

    pub(crate) fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: closed {}", self.device);
        }
    }
}
