//! # Channel Protocol
//!
//! Message records exchanged with the remote grievance service. Every message is
//! a JSON object whose `type` field selects the variant.
//!
//! ## Message Format:
//! - **Client → Service**: `{"type": "audio_chunk", "audio": "<base64>"}` only
//! - **Service → Client**: `text_chunk`, `audio_chunk`, `data_count`,
//!   `memory_wipe_start`, `memory_wipe_complete`, `call_complete`
//!
//! Unknown `type` values and malformed records are protocol errors. The session
//! logs and skips them, so newer services can add message kinds freely.

use crate::error::AppResult;
use serde::{Deserialize, Serialize};

/// Category of a `text_chunk`.
///
/// Anything the client does not know maps to `Unknown`; such chunks are still
/// logged in the intelligence feed but never touch the ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkCategory {
    #[default]
    Intent,
    Entity,
    Action,
    #[serde(other)]
    Unknown,
}

impl ChunkCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkCategory::Intent => "intent",
            ChunkCategory::Entity => "entity",
            ChunkCategory::Action => "action",
            ChunkCategory::Unknown => "unknown",
        }
    }
}

fn default_label() -> String {
    "Response".to_string()
}

/// Records produced by the remote service, consumed once each, in arrival order.
///
/// ## Rust Concepts:
/// - **#[serde(tag = "type")]**: internally tagged enum, the `type` field picks the variant
/// - **#[serde(default)]**: missing fields fall back to `Default`, extra fields are ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Partial transcript or extraction unit
    TextChunk {
        #[serde(default)]
        category: ChunkCategory,
        #[serde(default = "default_label")]
        label: String,
        #[serde(default)]
        text: String,
    },

    /// One encoded synthesized-speech payload
    AudioChunk { audio: String },

    /// Current number of retained data points (sovereignty indicator)
    DataCount { count: u64 },

    /// Server-side wipe has begun
    MemoryWipeStart,

    /// Server-side wipe has finished
    MemoryWipeComplete,

    /// Service finished responding for this turn
    CallComplete,
}

impl InboundEvent {
    /// Parse one text frame from the channel.
    pub fn parse(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of this event, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::TextChunk { .. } => "text_chunk",
            InboundEvent::AudioChunk { .. } => "audio_chunk",
            InboundEvent::DataCount { .. } => "data_count",
            InboundEvent::MemoryWipeStart => "memory_wipe_start",
            InboundEvent::MemoryWipeComplete => "memory_wipe_complete",
            InboundEvent::CallComplete => "call_complete",
        }
    }
}

/// Records sent by the client. Only capture frames travel this way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    AudioChunk { audio: String },
}

impl OutboundEvent {
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_chunk_parsing() {
        let event = InboundEvent::parse(
            r#"{"type":"text_chunk","category":"action","label":"Category","text":"Pothole"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::TextChunk {
                category: ChunkCategory::Action,
                label: "Category".to_string(),
                text: "Pothole".to_string(),
            }
        );
    }

    #[test]
    fn test_text_chunk_defaults_and_unknown_category() {
        let event = InboundEvent::parse(r#"{"type":"text_chunk","text":"hello"}"#).unwrap();
        match event {
            InboundEvent::TextChunk { category, label, .. } => {
                assert_eq!(category, ChunkCategory::Intent);
                assert_eq!(label, "Response");
            }
            other => panic!("Wrong event: {:?}", other),
        }

        let event =
            InboundEvent::parse(r#"{"type":"text_chunk","category":"sentiment","label":"Mood","text":"calm"}"#)
                .unwrap();
        assert!(matches!(event, InboundEvent::TextChunk { category: ChunkCategory::Unknown, .. }));
    }

    #[test]
    fn test_server_timestamp_field_is_ignored() {
        let event = InboundEvent::parse(
            r#"{"type":"memory_wipe_start","timestamp":"2026-01-01T10:00:00"}"#,
        )
        .unwrap();
        assert_eq!(event, InboundEvent::MemoryWipeStart);

        let event =
            InboundEvent::parse(r#"{"type":"data_count","count":7,"timestamp":"2026-01-01T10:00:00"}"#)
                .unwrap();
        assert_eq!(event, InboundEvent::DataCount { count: 7 });
    }

    #[test]
    fn test_unknown_type_and_garbage_are_errors() {
        assert!(InboundEvent::parse(r#"{"type":"system_message","message":"hi"}"#).is_err());
        assert!(InboundEvent::parse("not json").is_err());
        assert!(InboundEvent::parse(r#"{"type":"data_count","count":-1}"#).is_err());
    }

    #[test]
    fn test_outbound_wire_shape() {
        let json = OutboundEvent::AudioChunk { audio: "AAAA".to_string() }
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "audio_chunk");
        assert_eq!(value["audio"], "AAAA");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }
}
