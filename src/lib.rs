//! framecast
//!
//! Live camera capture, optional object detection and WebSocket fan-out to any
//! number of viewers.
//!
//! # Architecture
//!
//! ```text
//! CaptureSession ──write──▶ FrameCache ──read_newer──▶ SessionLoop (one per viewer)
//!                                                        │
//!                                                        ├─▶ DetectionEngine
//!                                                        └─▶ WebSocket (binary frame + detections JSON)
//! ```
//!
//! - `frame`: `Frame` and the single-slot `FrameCache`
//! - `capture`: capture backends and the producer thread
//! - `detect`: `DetectionEngine`, detector backends, label files
//! - `session`: per-viewer streaming loop and wire messages
//! - `server`: HTTP routes, WebSocket upgrade, bounded session workers
//! - `config`: TOML file + environment configuration

pub mod capture;
pub mod codec;
pub mod config;
pub mod detect;
pub mod frame;
pub mod server;
pub mod session;

pub use capture::{BackendKind, CaptureConfig, CaptureSession, CaptureStats};
pub use config::FramecastConfig;
pub use detect::{BoundingBox, DetectionConfig, DetectionEngine, DetectionResult, DetectionSettings};
pub use frame::{Frame, FrameCache};
pub use server::{Server, ServerConfig, ServerHandle};
pub use session::{ClientChannel, ClientCommand, ControlScope, SessionConfig, SessionLoop};
