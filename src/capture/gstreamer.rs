//! GStreamer capture source.
//!
//! Builds `v4l2src ! videoconvert ! jpegenc ! appsink` for the requested device
//! and pulls already-encoded JPEG samples from the sink. A bus error or EOS
//! fails every pull until the pipeline is rebuilt, which happens at most once
//! per `REOPEN_BACKOFF`.

use anyhow::{anyhow, Context, Result};
use std::time::{Duration, Instant};

use super::CaptureConfig;

const REOPEN_BACKOFF: Duration = Duration::from_secs(2);

pub(crate) struct GstreamerSource {
    config: CaptureConfig,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: Option<gstreamer_app::AppSink>,
    device: String,
    device_id: u32,
    last_error: Option<String>,
    failed_at: Option<Instant>,
}

impl GstreamerSource {
    pub(crate) fn new(config: CaptureConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            appsink: None,
            device: String::new(),
            device_id: 0,
            last_error: None,
            failed_at: None,
        })
    }

    pub(crate) fn open(&mut self, device_id: u32) -> Result<()> {
        self.close();
        self.device_id = device_id;
        self.device = self.config.device_for(device_id);

        let pipeline_description = format!(
            "v4l2src device={} ! video/x-raw,width={},height={} ! videoconvert ! \
             jpegenc quality={} ! appsink name=sink sync=false max-buffers=1 drop=true",
            self.device, self.config.width, self.config.height, self.config.jpeg_quality
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("sink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_caps(Some(&gstreamer::Caps::builder("image/jpeg").build()));

        if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(anyhow::Error::new(err)
                .context(format!("set capture pipeline for {} to Playing", self.device)));
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        self.last_error = None;
        self.failed_at = None;
        log::info!("GstreamerSource: opened {}", self.device);
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Vec<u8>> {
        self.poll_bus();
        if let Some(err) = self.last_error.clone() {
            if !self.reopen_due(Instant::now()) {
                return Err(anyhow!("{}", err));
            }
            log::warn!("GstreamerSource: reopening {} after: {}", self.device, err);
            if let Err(reopen) = self.open(self.device_id) {
                self.last_error = Some(err);
                self.failed_at = Some(Instant::now());
                return Err(reopen.context("reopen capture pipeline"));
            }
        }

        let appsink = self.appsink.as_ref().context("gstreamer source not opened")?;
        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(
                self.frame_timeout().as_millis() as u64,
            ))
            .ok_or_else(|| anyhow!("capture pipeline stalled"))?;
        let buffer = sample.buffer().context("capture sample missing buffer")?;
        let map = buffer.map_readable().context("map capture buffer")?;
        Ok(map.as_slice().to_vec())
    }

    pub(crate) fn close(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerSource: failed to stop pipeline: {}", err);
            }
            log::info!("GstreamerSource: closed {}", self.device);
        }
    }

    fn frame_timeout(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        Duration::from_millis(base_ms.max(500) as u64)
    }

    fn reopen_due(&self, now: Instant) -> bool {
        match self.failed_at {
            Some(failed_at) => now.saturating_duration_since(failed_at) >= REOPEN_BACKOFF,
            None => false,
        }
    }

    fn record_failure(&mut self, message: String) {
        if self.last_error.is_none() {
            self.failed_at = Some(Instant::now());
        }
        self.last_error = Some(message);
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.as_ref().and_then(|pipeline| pipeline.bus()) else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.record_failure(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.record_failure("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> GstreamerSource {
        GstreamerSource {
            config: CaptureConfig::default(),
            pipeline: None,
            appsink: None,
            device: "/dev/video0".to_string(),
            device_id: 0,
            last_error: None,
            failed_at: None,
        }
    }

    #[test]
    fn bus_failure_waits_for_backoff_before_reopen() {
        let mut source = source();
        assert!(!source.reopen_due(Instant::now()));

        source.record_failure("gstreamer reached EOS".to_string());
        let failed_at = source.failed_at.unwrap();
        assert!(!source.reopen_due(failed_at));
        assert!(!source.reopen_due(failed_at + REOPEN_BACKOFF / 2));
        assert!(source.reopen_due(failed_at + REOPEN_BACKOFF));

        // Further errors in the same outage keep the original failure time.
        source.record_failure("gstreamer error".to_string());
        assert_eq!(source.failed_at, Some(failed_at));
        assert_eq!(source.last_error.as_deref(), Some("gstreamer error"));
    }

    #[test]
    fn failed_source_reports_error_until_backoff_elapses() {
        let mut source = source();
        source.record_failure("gstreamer reached EOS".to_string());
        let err = source.next_frame().unwrap_err();
        assert!(err.to_string().contains("EOS"));
        assert!(source.pipeline.is_none());
    }
}
