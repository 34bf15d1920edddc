//! Per-client streaming loop.
//!
//! Each connected viewer gets one `SessionLoop::run` on its own worker thread.
//! A cycle drains pending client commands, pulls the newest frame from the
//! cache, sends it as a binary message and follows up with a detections
//! message. Any send failure ends the session; nothing a session does can
//! affect the cache, the capture thread or other sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::{DetectionEngine, DetectionResult, DetectionSettings};
use crate::frame::FrameCache;

/// Upper bound on commands handled per cycle so a chatty client cannot starve
/// its own frame delivery.
const MAX_COMMANDS_PER_CYCLE: usize = 16;

// ----------------------------------------------------------------------------
// Transport seam
// ----------------------------------------------------------------------------

/// Message-oriented client connection.
pub trait ClientChannel {
    fn send_binary(&mut self, data: &[u8]) -> Result<()>;

    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Wait briefly for one text message. `Ok(None)` means nothing arrived;
    /// `Err` means the peer is gone.
    fn recv_text(&mut self) -> Result<Option<String>>;

    /// Best-effort close handshake.
    fn close(&mut self);
}

// ----------------------------------------------------------------------------
// Wire messages
// ----------------------------------------------------------------------------

/// Client to server control message.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum ClientCommand {
    SetDetection { enabled: bool },
    SetConfidence { threshold: f32 },
}

impl ClientCommand {
    const KNOWN: [&'static str; 2] = ["setDetection", "setConfidence"];

    /// Parse one text message.
    ///
    /// Returns `Ok(None)` for well-formed messages naming a command this
    /// server does not know; those are ignored without closing the session.
    pub fn parse(text: &str) -> Result<Option<ClientCommand>> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("command is not valid JSON")?;
        let name = value
            .get("command")
            .and_then(|name| name.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("command object has no \"command\" field"))?;
        if !Self::KNOWN.contains(&name.as_str()) {
            return Ok(None);
        }
        let command = serde_json::from_value(value)
            .with_context(|| format!("malformed {} command", name))?;
        Ok(Some(command))
    }
}

/// Server to client detections message.
#[derive(Debug, Serialize)]
pub struct DetectionsMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    detections: &'a [DetectionResult],
}

impl<'a> DetectionsMessage<'a> {
    pub fn new(detections: &'a [DetectionResult]) -> Self {
        Self {
            kind: "detections",
            detections,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("serialize detections message")
    }
}

// ----------------------------------------------------------------------------
// Session configuration
// ----------------------------------------------------------------------------

/// Who owns the detection settings a client changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlScope {
    /// Each session starts from the engine defaults and changes only its own copy.
    #[default]
    PerClient,
    /// Commands update the shared engine; last writer wins for every client.
    Shared,
}

#[derive(Clone, Copy, Debug)]
pub struct SessionConfig {
    pub poll_interval: Duration,
    pub control_scope: ControlScope,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(30),
            control_scope: ControlScope::PerClient,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Streaming,
    Closing,
}

/// Why a session stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    Disconnected,
    SendFailed,
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub frames_sent: u64,
    pub detection_messages: u64,
    pub end: SessionEnd,
}

// ----------------------------------------------------------------------------
// SessionLoop
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct SessionLoop {
    cache: Arc<FrameCache>,
    engine: Arc<DetectionEngine>,
    config: SessionConfig,
    shutdown: Arc<AtomicBool>,
}

/// Mutable state of one connected client.
struct ClientSession {
    state: SessionState,
    settings: DetectionSettings,
    last_seq: u64,
    boxes_visible: bool,
    frames_sent: u64,
    detection_messages: u64,
    end: SessionEnd,
}

impl SessionLoop {
    pub fn new(
        cache: Arc<FrameCache>,
        engine: Arc<DetectionEngine>,
        config: SessionConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cache,
            engine,
            config,
            shutdown,
        }
    }

    /// Stream to `channel` until it fails, disconnects or shutdown is signalled.
    pub fn run<C: ClientChannel>(&self, channel: &mut C, peer: &str) -> SessionReport {
        let mut client = ClientSession {
            state: SessionState::Connecting,
            settings: self.engine.settings(),
            last_seq: 0,
            boxes_visible: false,
            frames_sent: 0,
            detection_messages: 0,
            end: SessionEnd::Disconnected,
        };
        log::info!("session {}: streaming", peer);
        client.state = SessionState::Streaming;

        while client.state == SessionState::Streaming {
            if self.shutdown.load(Ordering::Relaxed) {
                channel.close();
                client.close(SessionEnd::Shutdown);
                break;
            }
            self.cycle(channel, &mut client, peer);
            if client.state == SessionState::Streaming {
                std::thread::sleep(self.config.poll_interval);
            }
        }

        SessionReport {
            frames_sent: client.frames_sent,
            detection_messages: client.detection_messages,
            end: client.end,
        }
    }

    fn cycle<C: ClientChannel>(&self, channel: &mut C, client: &mut ClientSession, peer: &str) {
        if let Err(err) = self.drain_commands(channel, client, peer) {
            log::debug!("session {}: receive failed: {:#}", peer, err);
            client.close(SessionEnd::Disconnected);
            return;
        }

        let Some(frame) = self.cache.read_newer(client.last_seq) else {
            return;
        };
        if let Err(err) = channel.send_binary(frame.bytes()) {
            log::debug!("session {}: frame send failed: {:#}", peer, err);
            client.close(SessionEnd::SendFailed);
            return;
        }
        client.last_seq = frame.seq;
        client.frames_sent += 1;

        let detections = self
            .engine
            .process_frame_with(&frame, self.current_settings(client));
        // An empty list is sent once after boxes were shown so the viewer clears them.
        if detections.is_empty() && !client.boxes_visible {
            return;
        }
        let sent = DetectionsMessage::new(&detections)
            .to_json()
            .and_then(|json| channel.send_text(&json));
        if let Err(err) = sent {
            log::debug!("session {}: detections send failed: {:#}", peer, err);
            client.close(SessionEnd::SendFailed);
            return;
        }
        client.boxes_visible = !detections.is_empty();
        client.detection_messages += 1;
    }

    fn drain_commands<C: ClientChannel>(
        &self,
        channel: &mut C,
        client: &mut ClientSession,
        peer: &str,
    ) -> Result<()> {
        for _ in 0..MAX_COMMANDS_PER_CYCLE {
            let Some(text) = channel.recv_text()? else {
                break;
            };
            match ClientCommand::parse(&text) {
                Ok(Some(command)) => self.apply(command, client, peer),
                Ok(None) => log::debug!("session {}: ignoring unknown command {}", peer, text),
                Err(err) => log::warn!("session {}: ignoring command: {:#}", peer, err),
            }
        }
        Ok(())
    }

    fn apply(&self, command: ClientCommand, client: &mut ClientSession, peer: &str) {
        log::debug!("session {}: {:?}", peer, command);
        match (self.config.control_scope, command) {
            (ControlScope::PerClient, ClientCommand::SetDetection { enabled }) => {
                client.settings.enabled = enabled;
            }
            (ControlScope::PerClient, ClientCommand::SetConfidence { threshold }) => {
                if !client.settings.set_threshold(threshold) {
                    log::warn!("session {}: ignoring threshold {}", peer, threshold);
                }
            }
            (ControlScope::Shared, ClientCommand::SetDetection { enabled }) => {
                self.engine.set_enabled(enabled);
            }
            (ControlScope::Shared, ClientCommand::SetConfidence { threshold }) => {
                self.engine.set_confidence_threshold(threshold);
            }
        }
    }

    fn current_settings(&self, client: &ClientSession) -> DetectionSettings {
        match self.config.control_scope {
            ControlScope::PerClient => client.settings,
            ControlScope::Shared => self.engine.settings(),
        }
    }
}

impl ClientSession {
    fn close(&mut self, end: SessionEnd) {
        self.state = SessionState::Closing;
        self.end = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_jpeg;
    use crate::detect::{DetectionConfig, StubBackend};
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Scripted channel: publishes a fresh frame into the cache after every
    /// delivered one and signals shutdown after `max_frames`.
    struct MockChannel {
        cache: Arc<FrameCache>,
        shutdown: Arc<AtomicBool>,
        payload: Vec<u8>,
        binary: Vec<Vec<u8>>,
        text: Vec<String>,
        commands: VecDeque<(u64, String)>,
        fail_binary_after: Option<u64>,
        max_frames: u64,
        closed: bool,
    }

    impl MockChannel {
        fn new(cache: Arc<FrameCache>, shutdown: Arc<AtomicBool>, payload: Vec<u8>) -> Self {
            cache.write(payload.clone());
            Self {
                cache,
                shutdown,
                payload,
                binary: Vec::new(),
                text: Vec::new(),
                commands: VecDeque::new(),
                fail_binary_after: None,
                max_frames: 3,
                closed: false,
            }
        }

        fn command_after(mut self, frames: u64, command: &str) -> Self {
            self.commands.push_back((frames, command.to_string()));
            self
        }

        fn detection_lists(&self) -> Vec<usize> {
            self.text
                .iter()
                .map(|text| {
                    let value: serde_json::Value = serde_json::from_str(text).unwrap();
                    assert_eq!(value["type"], "detections");
                    value["detections"].as_array().unwrap().len()
                })
                .collect()
        }
    }

    impl ClientChannel for MockChannel {
        fn send_binary(&mut self, data: &[u8]) -> Result<()> {
            if let Some(limit) = self.fail_binary_after {
                if self.binary.len() as u64 >= limit {
                    return Err(anyhow!("broken pipe"));
                }
            }
            self.binary.push(data.to_vec());
            if self.binary.len() as u64 >= self.max_frames {
                self.shutdown.store(true, Ordering::SeqCst);
            } else {
                self.cache.write(self.payload.clone());
            }
            Ok(())
        }

        fn send_text(&mut self, text: &str) -> Result<()> {
            self.text.push(text.to_string());
            Ok(())
        }

        fn recv_text(&mut self) -> Result<Option<String>> {
            match self.commands.front() {
                Some((after, _)) if *after <= self.binary.len() as u64 => {
                    Ok(self.commands.pop_front().map(|(_, text)| text))
                }
                _ => Ok(None),
            }
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    fn jpeg() -> Vec<u8> {
        encode_jpeg(&vec![64u8; 32 * 24 * 3], 32, 24, 80).unwrap()
    }

    fn engine(config: &DetectionConfig) -> Arc<DetectionEngine> {
        Arc::new(DetectionEngine::new(
            Box::new(StubBackend::new()),
            vec!["person".to_string()],
            config,
        ))
    }

    fn session(
        engine: Arc<DetectionEngine>,
        scope: ControlScope,
    ) -> (SessionLoop, Arc<FrameCache>, Arc<AtomicBool>) {
        let cache = Arc::new(FrameCache::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let session = SessionLoop::new(
            cache.clone(),
            engine,
            SessionConfig {
                poll_interval: Duration::from_millis(1),
                control_scope: scope,
            },
            shutdown.clone(),
        );
        (session, cache, shutdown)
    }

    #[test]
    fn streams_frames_and_detections_until_shutdown() {
        let (session, cache, shutdown) =
            session(engine(&DetectionConfig::default()), ControlScope::PerClient);
        let mut channel = MockChannel::new(cache, shutdown, jpeg());

        let report = session.run(&mut channel, "test");
        assert_eq!(report.end, SessionEnd::Shutdown);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.detection_messages, 3);
        assert_eq!(channel.detection_lists(), vec![1, 1, 1]);
        assert!(channel.closed);
    }

    #[test]
    fn send_failure_ends_only_this_session() {
        let (session, cache, shutdown) =
            session(engine(&DetectionConfig::default()), ControlScope::PerClient);
        let mut channel = MockChannel::new(cache.clone(), shutdown.clone(), jpeg());
        channel.fail_binary_after = Some(1);

        let started = Instant::now();
        let report = session.run(&mut channel, "test");
        assert_eq!(report.end, SessionEnd::SendFailed);
        assert_eq!(report.frames_sent, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!shutdown.load(Ordering::SeqCst));

        // The cache is untouched by the failure and keeps serving others.
        let seq = cache.write(jpeg());
        assert_eq!(cache.read().map(|frame| frame.seq), seq);
    }

    #[test]
    fn frames_are_delivered_once_in_sequence_order() {
        let unavailable = Arc::new(DetectionEngine::unavailable(&DetectionConfig::default()));
        let (session, cache, shutdown) = session(unavailable, ControlScope::PerClient);
        let mut channel = MockChannel::new(cache.clone(), shutdown, vec![1, 2, 3]);
        channel.max_frames = 5;

        let report = session.run(&mut channel, "test");
        assert_eq!(report.frames_sent, 5);
        assert_eq!(report.detection_messages, 0);
        assert_eq!(cache.latest_seq(), 5);
        assert!(channel.text.is_empty());
    }

    #[test]
    fn per_client_threshold_does_not_touch_engine() {
        let shared = engine(&DetectionConfig::default());
        let (session, cache, shutdown) = session(shared.clone(), ControlScope::PerClient);
        let mut channel = MockChannel::new(cache, shutdown, jpeg())
            .command_after(0, r#"{"command":"setConfidence","threshold":0.8}"#);

        session.run(&mut channel, "test");
        // Stub confidence is 0.72, below the client's 0.8.
        assert!(channel.text.is_empty());
        assert_eq!(shared.settings().confidence_threshold, 0.5);
    }

    #[test]
    fn shared_scope_updates_engine() {
        let shared = engine(&DetectionConfig::default());
        let (session, cache, shutdown) = session(shared.clone(), ControlScope::Shared);
        let mut channel = MockChannel::new(cache, shutdown, jpeg())
            .command_after(0, r#"{"command":"setDetection","enabled":false}"#);

        session.run(&mut channel, "test");
        assert!(!shared.settings().enabled);
        assert!(channel.text.is_empty());
    }

    #[test]
    fn disabling_detection_sends_one_clearing_message() {
        let (session, cache, shutdown) =
            session(engine(&DetectionConfig::default()), ControlScope::PerClient);
        let mut channel = MockChannel::new(cache, shutdown, jpeg())
            .command_after(1, r#"{"command":"setDetection","enabled":false}"#);
        channel.max_frames = 4;

        session.run(&mut channel, "test");
        assert_eq!(channel.detection_lists(), vec![1, 0]);
    }

    #[test]
    fn unknown_and_malformed_commands_keep_the_session_open() {
        let (session, cache, shutdown) =
            session(engine(&DetectionConfig::default()), ControlScope::PerClient);
        let mut channel = MockChannel::new(cache, shutdown, jpeg())
            .command_after(0, r#"{"command":"zoom","level":3}"#)
            .command_after(0, "not json")
            .command_after(0, r#"{"command":"setConfidence","threshold":"high"}"#);

        let report = session.run(&mut channel, "test");
        assert_eq!(report.end, SessionEnd::Shutdown);
        assert_eq!(report.frames_sent, 3);
        assert_eq!(channel.detection_lists(), vec![1, 1, 1]);
    }

    #[test]
    fn command_parsing() -> Result<()> {
        assert_eq!(
            ClientCommand::parse(r#"{"command":"setDetection","enabled":true}"#)?,
            Some(ClientCommand::SetDetection { enabled: true })
        );
        assert_eq!(
            ClientCommand::parse(r#"{"command":"setConfidence","threshold":0.25}"#)?,
            Some(ClientCommand::SetConfidence { threshold: 0.25 })
        );
        assert_eq!(ClientCommand::parse(r#"{"command":"reboot"}"#)?, None);
        assert!(ClientCommand::parse(r#"{"enabled":true}"#).is_err());
        let err = ClientCommand::parse(r#"{"command":"setDetection"}"#).unwrap_err();
        assert!(format!("{:#}", err).contains("malformed setDetection command"));
        Ok(())
    }

    #[test]
    fn detections_message_shape() -> Result<()> {
        let json = DetectionsMessage::new(&[]).to_json()?;
        assert_eq!(json, r#"{"type":"detections","detections":[]}"#);
        Ok(())
    }
}
