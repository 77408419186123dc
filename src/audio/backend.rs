//! # Audio Backend
//!
//! Where microphones and speakers come from. Production uses `cpal`; tests plug
//! in the fakes from the `testing` module.
//!
//! ## Thread Safety:
//! `cpal::Stream` is not `Send` on every platform, so each open stream lives on
//! its own [`StreamThread`]. The thread builds the stream, reports whether that
//! worked, then parks until it is told to stop and drops the stream there.
//!
//! Opening waits for the device and belongs on the blocking pool. Stopping only
//! signals the thread and never waits.

use crate::audio::capture::{CpalMicrophone, Microphone};
use crate::audio::playback::{CpalSpeaker, Speaker};
use crate::error::{AppError, AppResult};
use std::sync::mpsc;
use std::thread;
use tracing::debug;

/// Factory for the audio devices one call needs.
pub trait AudioBackend: Send + Sync {
    fn microphone(&self) -> AppResult<Box<dyn Microphone>>;
    fn speaker(&self) -> AppResult<Box<dyn Speaker>>;
}

/// Default `cpal` host, optionally pinned to named devices.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn microphone(&self) -> AppResult<Box<dyn Microphone>> {
        Ok(Box::new(CpalMicrophone::new(self.input_device.clone())))
    }

    fn speaker(&self) -> AppResult<Box<dyn Speaker>> {
        Ok(Box::new(CpalSpeaker::new(self.output_device.clone())))
    }
}

/// A dedicated thread that owns one running `cpal::Stream`.
pub(crate) struct StreamThread {
    stop: Option<mpsc::Sender<()>>,
}

impl StreamThread {
    /// Spawn the thread and wait until `build` has produced a playing stream.
    ///
    /// `build` returns the stream plus whatever the caller needs to know about it
    /// (for example the negotiated output format).
    pub(crate) fn spawn<T, F>(name: &str, build: F) -> AppResult<(Self, T)>
    where
        T: Send + 'static,
        F: FnOnce() -> AppResult<(cpal::Stream, T)> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<AppResult<T>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let (stream, info) = match build() {
                    Ok(built) => built,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(info));

                // Returns on an explicit stop or when the owner goes away.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AppError::Internal(format!("Failed to spawn {} thread: {}", name, e)))?;

        match ready_rx.recv() {
            Ok(Ok(info)) => {
                debug!(thread = name, "Audio stream running");
                Ok((Self { stop: Some(stop_tx) }, info))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AppError::Internal(format!("{} thread exited during setup", name)))
            }
        }
    }

    /// Tell the thread to drop its stream. Returns without waiting. Idempotent.
    pub(crate) fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Find an input or output device by exact name, or fall back to the host default.
pub(crate) fn select_device<I>(
    devices: I,
    wanted: Option<&str>,
    default: Option<cpal::Device>,
    kind: &str,
) -> Result<cpal::Device, String>
where
    I: Iterator<Item = cpal::Device>,
{
    use cpal::traits::DeviceTrait;

    match wanted {
        Some(name) => {
            let mut devices = devices;
            devices
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| format!("No {} device named '{}'", kind, name))
        }
        None => default.ok_or_else(|| format!("No default {} device found", kind)),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable audio devices for session and pipeline tests.

    use super::*;
    use crate::audio::capture::{CaptureErrorSink, SampleSink};
    use crate::audio::playback::PcmClip;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Shared view of what the fake devices have been asked to do.
    #[derive(Default)]
    pub struct FakeAudio {
        pub mic_running: Mutex<bool>,
        pub mic_starts: Mutex<u32>,
        pub mic_stops: Mutex<u32>,
        /// When set, microphone start waits here until the sender fires or drops
        pub mic_gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
        pub sink: Mutex<Option<SampleSink>>,
        pub on_error: Mutex<Option<CaptureErrorSink>>,
        pub deny_microphone: Mutex<bool>,
        pub speaker_open: Mutex<bool>,
        pub clips: Mutex<Vec<PcmClip>>,
    }

    impl FakeAudio {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Deliver one block of microphone samples, as the device callback would.
        pub fn speak(&self, samples: &[f32]) {
            let sink = self.sink.lock().clone();
            if let Some(sink) = sink {
                sink(samples);
            }
        }

        /// Fail the running microphone, as a device error callback would.
        pub fn fail_microphone(&self, message: &str) {
            let on_error = self.on_error.lock().clone();
            if let Some(on_error) = on_error {
                on_error(AppError::Capture(message.to_string()));
            }
        }

        pub fn mic_running(&self) -> bool {
            *self.mic_running.lock()
        }

        pub fn speaker_open(&self) -> bool {
            *self.speaker_open.lock()
        }

        pub fn clip_count(&self) -> usize {
            self.clips.lock().len()
        }
    }

    pub struct FakeMicrophone(Arc<FakeAudio>);

    impl Microphone for FakeMicrophone {
        fn start(&mut self, on_samples: SampleSink, on_error: CaptureErrorSink) -> AppResult<()> {
            let gate = self.0.mic_gate.lock().take();
            if let Some(gate) = gate {
                let _ = gate.recv();
            }
            if *self.0.deny_microphone.lock() {
                return Err(AppError::Capture("Microphone permission denied".to_string()));
            }
            *self.0.sink.lock() = Some(on_samples);
            *self.0.on_error.lock() = Some(on_error);
            *self.0.mic_running.lock() = true;
            *self.0.mic_starts.lock() += 1;
            Ok(())
        }

        fn stop(&mut self) {
            *self.0.mic_stops.lock() += 1;
            *self.0.sink.lock() = None;
            *self.0.on_error.lock() = None;
            *self.0.mic_running.lock() = false;
        }
    }

    pub struct FakeSpeaker(Arc<FakeAudio>);

    impl Speaker for FakeSpeaker {
        fn open(&mut self) -> AppResult<()> {
            *self.0.speaker_open.lock() = true;
            Ok(())
        }

        fn enqueue(&mut self, clip: PcmClip) -> AppResult<()> {
            if !*self.0.speaker_open.lock() {
                return Err(AppError::Playback("Speaker is not open".to_string()));
            }
            self.0.clips.lock().push(clip);
            Ok(())
        }

        fn close(&mut self) {
            *self.0.speaker_open.lock() = false;
        }
    }

    impl Drop for FakeSpeaker {
        fn drop(&mut self) {
            self.close();
        }
    }

    pub struct FakeBackend(pub Arc<FakeAudio>);

    impl AudioBackend for FakeBackend {
        fn microphone(&self) -> AppResult<Box<dyn Microphone>> {
            Ok(Box::new(FakeMicrophone(Arc::clone(&self.0))))
        }

        fn speaker(&self) -> AppResult<Box<dyn Speaker>> {
            Ok(Box::new(FakeSpeaker(Arc::clone(&self.0))))
        }
    }

    /// 16-bit PCM WAV file holding `samples`.
    pub fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};

        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);

        out.extend_from_slice(b"RIFF");
        out.write_u32::<LittleEndian>(36 + data_len).unwrap();
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.write_u32::<LittleEndian>(16).unwrap();
        out.write_u16::<LittleEndian>(1).unwrap();
        out.write_u16::<LittleEndian>(channels).unwrap();
        out.write_u32::<LittleEndian>(sample_rate).unwrap();
        out.write_u32::<LittleEndian>(sample_rate * block_align as u32).unwrap();
        out.write_u16::<LittleEndian>(block_align).unwrap();
        out.write_u16::<LittleEndian>(16).unwrap();
        out.extend_from_slice(b"data");
        out.write_u32::<LittleEndian>(data_len).unwrap();
        for sample in samples {
            out.write_i16::<LittleEndian>(*sample).unwrap();
        }
        out
    }
}
