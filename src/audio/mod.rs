//! # Audio Module
//!
//! Local audio for the call: microphone capture going out, synthesized speech
//! coming back.
//!
//! ## Key Components:
//! - **frame**: fixed-length framing of microphone samples
//! - **capture**: microphone seam, `cpal` input stream and the capture pipeline
//! - **playback**: payload decoding (`symphonia`), speaker seam and the queued scheduler
//! - **backend**: device factory and the thread that owns each `cpal` stream
//! - [`CallDevices`]: everything one call acquires, opened together on the blocking pool
//!
//! ## Audio Format:
//! - **Outbound**: mono `f32` frames at the device's native rate, 4096 samples by default
//! - **Inbound**: any container symphonia can probe (MP3 from the speech service, WAV)

pub mod backend;
pub mod capture;
pub mod frame;
pub mod playback;

use crate::channel::FrameOutlet;
use crate::error::AppResult;
use crate::stats::CallStats;
use backend::AudioBackend;
use capture::{CaptureErrorSink, CapturePipeline};
use playback::Speaker;
use std::fmt;
use std::sync::Arc;

/// The devices one call runs on: a started capture pipeline and, if one could
/// be opened, a speaker.
pub struct CallDevices {
    pub capture: CapturePipeline,
    pub speaker: AppResult<Box<dyn Speaker>>,
}

impl CallDevices {
    /// Open the microphone (required) and the speaker (optional).
    ///
    /// Waits on the devices, so call it from `spawn_blocking`.
    pub fn acquire(
        backend: &dyn AudioBackend,
        outlet: FrameOutlet,
        frame_samples: usize,
        on_error: CaptureErrorSink,
        stats: Arc<CallStats>,
    ) -> AppResult<Self> {
        let microphone = backend.microphone()?;
        let mut capture = CapturePipeline::new(microphone, stats);
        capture.start(outlet, frame_samples, on_error)?;

        let speaker = backend.speaker().and_then(|mut speaker| {
            speaker.open()?;
            Ok(speaker)
        });

        Ok(Self { capture, speaker })
    }

    /// Give everything back without using it.
    pub fn release(mut self) {
        self.capture.stop();
        if let Ok(speaker) = self.speaker.as_mut() {
            speaker.close();
        }
    }
}

impl fmt::Debug for CallDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDevices")
            .field("capture_running", &self.capture.is_running())
            .field("speaker", &self.speaker.as_ref().map(|_| "open"))
            .finish()
    }
}
