//! FFmpeg capture source.
//!
//! `/dev/video*` paths are opened through libavdevice's video4linux2 demuxer;
//! anything else (files, network URLs) goes through the regular demuxers.
//! Decoded frames are scaled to the configured size and encoded to JPEG.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::CaptureConfig;
use crate::codec::encode_jpeg;

struct DecodePipeline {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
}

pub(crate) struct FfmpegSource {
    config: CaptureConfig,
    pipeline: Option<DecodePipeline>,
    device: String,
}

impl FfmpegSource {
    pub(crate) fn new(config: CaptureConfig) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        Ok(Self {
            config,
            pipeline: None,
            device: String::new(),
        })
    }

    pub(crate) fn open(&mut self, device_id: u32) -> Result<()> {
        self.close();
        self.device = self.config.device_for(device_id);

        let input = open_input(&self.device, &self.config)?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video stream", self.device))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            self.config.width,
            self.config.height,
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        self.pipeline = Some(DecodePipeline {
            input,
            stream_index,
            decoder,
            scaler,
        });
        log::info!("FfmpegSource: opened {}", self.device);
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Vec<u8>> {
        let pipeline = self.pipeline.as_mut().context("ffmpeg source not opened")?;
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in pipeline.input.packets() {
            if stream.index() != pipeline.stream_index {
                continue;
            }
            pipeline
                .decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            if pipeline.decoder.receive_frame(&mut decoded).is_ok() {
                pipeline
                    .scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
                return encode_jpeg(&pixels, width, height, self.config.jpeg_quality);
            }
        }

        Err(anyhow!("{} ended without further frames", self.device))
    }

    pub(crate) fn close(&mut self) {
        if self.pipeline.take().is_some() {
            log::info!("FfmpegSource: closed {}", self.device);
        }
    }
}

fn open_input(device: &str, config: &CaptureConfig) -> Result<ffmpeg::format::context::Input> {
    if !device.starts_with("/dev/video") {
        return ffmpeg::format::input(&device)
            .with_context(|| format!("open '{}' with ffmpeg", device));
    }

    ffmpeg::device::register_all();
    let format = ffmpeg::device::input::video()
        .find(|format| {
            format
                .name()
                .split(',')
                .any(|name| name == "video4linux2" || name == "v4l2")
        })
        .ok_or_else(|| anyhow!("ffmpeg was built without the video4linux2 input device"))?;

    let mut options = ffmpeg::Dictionary::new();
    options.set("video_size", &format!("{}x{}", config.width, config.height));
    if config.target_fps > 0 {
        options.set("framerate", &config.target_fps.to_string());
    }
    let context = ffmpeg::format::open_with(device, &format, options)
        .with_context(|| format!("open v4l2 device {} with ffmpeg", device))?;
    Ok(context.input())
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("ffmpeg frame is shorter than expected")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
