//! # Capture Pipeline
//!
//! Microphone → fixed-length frames → base64 → channel.
//!
//! ## Key Features:
//! - **Device seam**: [`Microphone`] hides `cpal` so the session can run against fakes
//! - **Drop, never block**: a finished frame is offered to the channel once; if the
//!   channel is not open or its queue is full the frame is dropped and counted
//! - **Mono contract**: microphones deliver mono blocks; multi-channel devices keep
//!   only their first channel
//!
//! ## Thread Safety:
//! The sample callback runs on the audio device thread. The frame assembler sits
//! behind a `parking_lot::Mutex` that only that thread takes during a call.

use crate::audio::backend::{select_device, StreamThread};
use crate::audio::frame::FrameAssembler;
use crate::channel::FrameOutlet;
use crate::codec;
use crate::error::{AppError, AppResult};
use crate::protocol::OutboundEvent;
use crate::stats::CallStats;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receives mono sample blocks from the device thread.
pub type SampleSink = Arc<dyn Fn(&[f32]) + Send + Sync>;

/// Receives device failures after the stream started.
pub type CaptureErrorSink = Arc<dyn Fn(AppError) + Send + Sync>;

/// A source of mono microphone samples.
pub trait Microphone: Send {
    /// Acquire the device and start delivering samples to `on_samples`.
    ///
    /// Permission or device problems surface here as [`AppError::Capture`].
    fn start(&mut self, on_samples: SampleSink, on_error: CaptureErrorSink) -> AppResult<()>;

    /// Release the device. Idempotent.
    fn stop(&mut self);
}

/// Microphone backed by a `cpal` input stream.
pub struct CpalMicrophone {
    device_name: Option<String>,
    stream: Option<StreamThread>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            stream: None,
        }
    }
}

impl Microphone for CpalMicrophone {
    fn start(&mut self, on_samples: SampleSink, on_error: CaptureErrorSink) -> AppResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let (stream, sample_rate) = StreamThread::spawn("grievance-capture", move || {
            open_input_stream(device_name.as_deref(), on_samples, on_error)
        })?;

        info!(sample_rate, "Microphone capture started");
        self.stream = Some(stream);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("Microphone capture stopped");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build and start the input stream. Runs on the stream thread.
fn open_input_stream(
    device_name: Option<&str>,
    on_samples: SampleSink,
    on_error: CaptureErrorSink,
) -> AppResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| AppError::Capture(format!("Failed to list input devices: {}", e)))?;
    let device = select_device(devices, device_name, host.default_input_device(), "input")
        .map_err(AppError::Capture)?;

    let supported = device
        .default_input_config()
        .map_err(|e| AppError::Capture(format!("Failed to get input config: {}", e)))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    info!(
        device = %device.name().unwrap_or_else(|_| "unknown".to_string()),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        format = ?sample_format,
        "Opening microphone"
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, on_samples, on_error)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config, on_samples, on_error)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config, on_samples, on_error)?,
        other => {
            return Err(AppError::Capture(format!(
                "Unsupported input sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AppError::Capture(format!("Failed to start input stream: {}", e)))?;

    Ok((stream, config.sample_rate.0))
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    on_samples: SampleSink,
    on_error: CaptureErrorSink,
) -> AppResult<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // First channel only
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| frame[0].to_sample::<f32>())
                    .collect();
                on_samples(&mono);
            },
            move |err| {
                on_error(AppError::Capture(format!("Input stream error: {}", err)));
            },
            None,
        )
        .map_err(|e| AppError::Capture(format!("Failed to build input stream: {}", e)))
}

/// Microphone plus framing, wired to one channel for the length of a call.
pub struct CapturePipeline {
    microphone: Box<dyn Microphone>,
    stats: Arc<CallStats>,
    running: bool,
}

impl CapturePipeline {
    pub fn new(microphone: Box<dyn Microphone>, stats: Arc<CallStats>) -> Self {
        Self {
            microphone,
            stats,
            running: false,
        }
    }

    /// Start capturing and sending `frame_samples`-long frames through `outlet`.
    pub fn start(
        &mut self,
        outlet: FrameOutlet,
        frame_samples: usize,
        on_error: CaptureErrorSink,
    ) -> AppResult<()> {
        if self.running {
            return Ok(());
        }

        let assembler = Arc::new(Mutex::new(FrameAssembler::new(frame_samples)));
        let stats = Arc::clone(&self.stats);

        let sink: SampleSink = Arc::new(move |block: &[f32]| {
            let frames = assembler.lock().push(block);
            for frame in frames {
                let event = OutboundEvent::AudioChunk {
                    audio: codec::encode_samples(&frame),
                };
                if outlet.offer(event) {
                    stats.record_frame_sent();
                } else {
                    stats.record_frame_dropped();
                }
            }
        });

        self.microphone.start(sink, on_error)?;
        self.running = true;
        debug!(frame_samples, "Capture pipeline running");
        Ok(())
    }

    /// Release the microphone. Always reaches the device, even if `start`
    /// failed half way. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.microphone.stop();
        if self.running {
            self.running = false;
            let stats = self.stats.snapshot();
            if stats.frames_dropped > 0 {
                warn!(
                    sent = stats.frames_sent,
                    dropped = stats.frames_dropped,
                    "Some capture frames never reached the channel"
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
