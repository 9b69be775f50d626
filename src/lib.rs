//! Beacon Lens - Voice-driven camera assistant
//!
//! Ask a question out loud, and Beacon Lens looks through the camera and
//! answers. This library provides:
//! - Microphone permission tracking
//! - Camera capture and still-frame extraction
//! - Speech input (recognition) and output (synthesis) channels
//! - Vision queries against an OpenAI-compatible model
//! - The session orchestrator that sequences a turn
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                SessionHandle (CLI)                   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ commands / snapshots
//! ┌────────────────────▼────────────────────────────────┐
//! │               SessionOrchestrator                    │
//! │  Permission │ Capture │ Speech in │ Speech out │ Vision │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │              Platform capabilities                   │
//! │   cpal mic/speaker  │  camera  │  Whisper  │  TTS   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod camera;
pub mod config;
pub mod error;
pub mod permission;
pub mod session;
pub mod speech;
pub mod vision;
pub mod voice;

pub use camera::{CaptureController, CaptureError, Facing, StillImageCamera};
pub use config::Config;
pub use error::{Error, Result};
pub use permission::{PermissionGate, PermissionState};
pub use session::{
    SessionComponents, SessionHandle, SessionOrchestrator, SessionPhase, SessionSettings,
    SessionSnapshot,
};
pub use speech::{AudioOutputController, SpeechInputController};
pub use vision::{QueryError, VisionQuery, VisionQueryService};
