//! # Grievance Call Client
//!
//! Voice client for a municipal grievance hotline. It places a call to the
//! remote grievance service, streams microphone audio to it, plays back the
//! service's synthesized speech, and keeps a live view of what the conversation
//! has produced: an intelligence log, a grievance ticket, and the service's
//! data-retention status.
//!
//! ## Application Architecture:
//! - **session**: the call state machine; sole owner of every call resource
//! - **channel**: WebSocket channel to the service
//! - **protocol**: message records on that channel
//! - **grievance**: ticket reducer over inbound events
//! - **audio**: capture, playback and the device seam
//! - **codec**: base64 transport encoding for audio
//! - **console**: terminal commands and rendering
//! - **config** / **error** / **stats**: ambient plumbing

pub mod audio;
pub mod channel;
pub mod codec;
pub mod config;
pub mod console;
pub mod dialpad;
pub mod error;
pub mod grievance;
pub mod protocol;
pub mod session;
pub mod stats;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use session::{CallSession, CallSettings, CallState, SessionHandle, SessionSnapshot};
