//! # Audio Codec
//!
//! Converts raw audio to and from the transport-safe text form carried in the
//! `audio` field of `audio_chunk` records.
//!
//! ## Wire Format:
//! - **Outbound frames**: mono `f32` samples, little-endian, then standard base64
//! - **Inbound speech**: opaque container bytes (MP3/WAV), standard base64
//!
//! `decode_bytes(&encode_bytes(x)) == x` for every byte buffer, and
//! `decode_samples(&encode_samples(x))` returns the same samples bit for bit.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Size of one encoded sample in bytes.
const SAMPLE_BYTES: usize = 4;

/// Failure to turn transport text back into audio.
///
/// The playback scheduler catches these; they never end a call.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not valid standard base64 (bad alphabet, wrong padding, truncated)
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// Decoded length is not a whole number of `f32` samples
    #[error("payload of {0} bytes is not a whole number of f32 samples")]
    MisalignedSamples(usize),

    /// Bytes decoded fine but the container or its packets could not be read
    #[error("unreadable audio container: {0}")]
    Media(String),
}

/// Encode an arbitrary byte buffer.
pub fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport text back into the original bytes.
pub fn decode_bytes(text: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(STANDARD.decode(text.trim())?)
}

/// Encode a frame of mono samples as little-endian `f32` bytes.
///
/// ## Rust Concepts:
/// - **ByteOrder::write_f32_into**: bulk conversion into a pre-sized byte slice,
///   no per-sample `Result` to handle
pub fn encode_samples(samples: &[f32]) -> String {
    let mut bytes = vec![0u8; samples.len() * SAMPLE_BYTES];
    LittleEndian::write_f32_into(samples, &mut bytes);
    encode_bytes(&bytes)
}

/// Decode transport text produced by [`encode_samples`].
pub fn decode_samples(text: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = decode_bytes(text)?;
    if bytes.len() % SAMPLE_BYTES != 0 {
        return Err(DecodeError::MisalignedSamples(bytes.len()));
    }

    let mut samples = vec![0.0f32; bytes.len() / SAMPLE_BYTES];
    LittleEndian::read_f32_into(&bytes, &mut samples);
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_round_trip_across_padding_lengths() {
        // Lengths 0..=6 cover every base64 padding case twice.
        for len in 0..=6u8 {
            let bytes: Vec<u8> = (0..len).map(|b| b.wrapping_mul(37)).collect();
            assert_eq!(decode_bytes(&encode_bytes(&bytes)).unwrap(), bytes);
        }

        let all: Vec<u8> = (0..=255u8).collect();
        assert_eq!(decode_bytes(&encode_bytes(&all)).unwrap(), all);
    }

    #[test]
    fn test_sample_round_trip_is_bit_exact() {
        let samples = vec![0.0, -0.0, 1.0, -1.0, 0.123_456_79, f32::MIN_POSITIVE, f32::MAX];
        let decoded = decode_samples(&encode_samples(&samples)).unwrap();

        let original_bits: Vec<u32> = samples.iter().map(|s| s.to_bits()).collect();
        let decoded_bits: Vec<u32> = decoded.iter().map(|s| s.to_bits()).collect();
        assert_eq!(original_bits, decoded_bits);
    }

    #[test]
    fn test_samples_are_little_endian_f32() {
        // 1.0f32 is 0x3F800000
        let text = encode_samples(&[1.0]);
        assert_eq!(decode_bytes(&text).unwrap(), vec![0x00, 0x00, 0x80, 0x3F]);
    }

    #[test]
    fn test_malformed_text_is_rejected() {
        assert!(matches!(decode_bytes("not base64!"), Err(DecodeError::InvalidBase64(_))));
        // Missing padding
        assert!(matches!(decode_bytes("QQ"), Err(DecodeError::InvalidBase64(_))));
    }

    #[test]
    fn test_misaligned_sample_payload_is_rejected() {
        let text = encode_bytes(&[1, 2, 3]);
        assert!(matches!(decode_samples(&text), Err(DecodeError::MisalignedSamples(3))));
    }
}
