//! # Error Handling
//!
//! Custom error types for the call client and how they map onto the call lifecycle.
//!
//! ## Error Categories:
//! - **Channel**: open failure, unexpected close, transport error (call-ending)
//! - **Capture**: microphone permission denied or device failure (call-ending)
//! - **Playback**: output device failure (call continues without synthesized audio)
//! - **Decode**: malformed inbound audio payload (recovered locally, chunk dropped)
//! - **Protocol**: unrecognized or malformed inbound record (ignored)
//! - **Config / InvalidConfig**: configuration problems, surfaced at startup
//!
//! ## Usage Example:
//! ```rust,ignore
//! return Err(AppError::Capture("No default input device".to_string()));
//! ```

use crate::codec::DecodeError;
use thiserror::Error;

/// Custom error types for the application.
///
/// ## Rust Concepts:
/// - **#[derive(Error)]**: `thiserror` generates the `Display` and `Error` impls
/// - **#[from]**: generates a `From` conversion so `?` works on the wrapped error
#[derive(Debug, Error)]
pub enum AppError {
    /// The bidirectional channel failed to open, closed, or errored
    #[error("Channel error: {0}")]
    Channel(String),

    /// Microphone access or capture stream failure
    #[error("Capture error: {0}")]
    Capture(String),

    /// Output device failure while rendering synthesized audio
    #[error("Playback error: {0}")]
    Playback(String),

    /// Inbound audio payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Inbound record was not valid JSON or had an unknown `type`
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration loaded but failed validation rules
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Anything else (task join failures, poisoned state)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error must end the active call.
    ///
    /// Channel and capture failures force a hangup; everything else is
    /// recovered where it happens.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Channel(_) | AppError::Capture(_))
    }

    /// Short machine-readable kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Channel(_) => "channel",
            AppError::Capture(_) => "capture",
            AppError::Playback(_) => "playback",
            AppError::Decode(_) => "decode",
            AppError::Protocol(_) => "protocol",
            AppError::Config(_) => "config",
            AppError::InvalidConfig(_) => "invalid_config",
            AppError::Internal(_) => "internal",
        }
    }
}

/// Automatic conversion from WebSocket transport errors.
///
/// Every tungstenite failure is a channel failure from the session's point of view.
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Channel(err.to_string())
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::InvalidConfig(format!("invalid service origin: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// fn open_microphone() -> AppResult<CpalMicrophone> { ... }
/// ```
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AppError::Channel("refused".to_string()).is_fatal());
        assert!(AppError::Capture("permission denied".to_string()).is_fatal());
        assert!(!AppError::Playback("no output".to_string()).is_fatal());
        assert!(!AppError::Decode(DecodeError::MisalignedSamples(3)).is_fatal());
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "protocol");
        assert!(!err.is_fatal());
        assert!(err.to_string().starts_with("Protocol error"));
    }
}
