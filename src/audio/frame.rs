//! # Frame Assembly
//!
//! The microphone delivers mono sample blocks of whatever size the device likes.
//! The channel wants fixed-length frames. `FrameAssembler` sits in between.
//!
//! ## Key Features:
//! - **Fixed frames**: every emitted frame is exactly `frame_samples` long
//! - **No backlog**: only the partial frame in progress is kept between callbacks

/// Default frame length in samples.
///
/// A power of two keeps latency low without drowning the channel in tiny records.
pub const DEFAULT_FRAME_SAMPLES: usize = 4096;

/// Accumulates mono samples into fixed-length frames.
///
/// ## Memory Management:
/// The pending buffer never holds more than one frame's worth of samples:
/// complete frames are handed out as soon as they fill.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
    frames_emitted: u64,
}

impl FrameAssembler {
    /// Create an assembler. A zero frame length is treated as one sample.
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
            frames_emitted: 0,
        }
    }

    /// Push one block of samples; returns every frame it completed.
    ///
    /// ## Rust Concepts:
    /// - **std::mem::replace**: hands off the full buffer without copying it
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        let mut rest = samples;

        while !rest.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_samples {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_samples));
                frames.push(full);
                self.frames_emitted += 1;
            }
        }

        frames
    }

    /// Number of samples waiting for the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_SAMPLES)
    }
}
