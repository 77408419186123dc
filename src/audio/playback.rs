//! # Playback Scheduler
//!
//! Turns inbound `audio_chunk` payloads into sound.
//!
//! ## Scheduling Policy:
//! Chunks are **queued**: each one is decoded and appended to the speaker in
//! arrival order, so consecutive sentences of synthesized speech never overlap
//! and never cut each other off. Decoding is the only slow step; it runs on the
//! blocking pool and one chunk at a time, which keeps the order intact.
//!
//! Stopping closes the speaker on the spot and drops whatever was still queued
//! for it.
//!
//! ## Error Handling:
//! A payload that is not base64, or whose container cannot be read, is logged,
//! counted, and skipped. Playback problems never end the call.

use crate::audio::backend::{select_device, StreamThread};
use crate::codec::{self, DecodeError};
use crate::error::{AppError, AppResult};
use crate::stats::CallStats;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decoded audio ready for a speaker.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmClip {
    /// Interleaved samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmClip {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Average all channels down to one.
    pub fn to_mono(&self) -> Vec<f32> {
        let channels = self.channels.max(1) as usize;
        if channels == 1 {
            return self.samples.clone();
        }
        self.samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }
}

/// An audio output the scheduler can append clips to.
pub trait Speaker: Send {
    /// Acquire the output device.
    fn open(&mut self) -> AppResult<()>;

    /// Append a clip after everything already queued.
    fn enqueue(&mut self, clip: PcmClip) -> AppResult<()>;

    /// Release the output device and drop anything still queued. Idempotent.
    fn close(&mut self);
}

/// Decode one inbound payload: base64 text → container bytes → PCM.
///
/// Accepts anything symphonia can probe (MP3 from the speech service, WAV, ...).
pub fn decode_payload(payload: &str) -> Result<PcmClip, DecodeError> {
    let bytes = codec::decode_bytes(payload)?;
    decode_container(bytes)
}

/// Decode container bytes into interleaved `f32` PCM.
pub fn decode_container(bytes: Vec<u8>) -> Result<PcmClip, DecodeError> {
    let media = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            media,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| DecodeError::Media(format!("unrecognized format: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| DecodeError::Media("no audio track".to_string()))?;
    let track_id = track.id;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Media(format!("unsupported codec: {}", e)))?;

    let mut samples = Vec::new();
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(DecodeError::Media(format!("failed to read packet: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;

                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            // A single corrupt packet is skipped
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(error = %e, "Skipping undecodable packet");
            }
            Err(e) => return Err(DecodeError::Media(format!("decoder failed: {}", e))),
        }
    }

    if samples.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(DecodeError::Media("payload contained no audio".to_string()));
    }

    Ok(PcmClip {
        samples,
        sample_rate,
        channels,
    })
}

type SharedSpeaker = Arc<Mutex<Box<dyn Speaker>>>;

/// Queued playback for one call.
pub struct PlaybackScheduler {
    submit: Option<mpsc::UnboundedSender<String>>,
    speaker: SharedSpeaker,
    task: Option<JoinHandle<()>>,
}

impl PlaybackScheduler {
    /// Start the playback task on a speaker that is already open.
    pub fn start(speaker: Box<dyn Speaker>, stats: Arc<CallStats>) -> Self {
        let speaker: SharedSpeaker = Arc::new(Mutex::new(speaker));
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_playback(Arc::clone(&speaker), submit_rx, stats));

        Self {
            submit: Some(submit_tx),
            speaker,
            task: Some(task),
        }
    }

    /// Queue one encoded payload. Returns `false` once stopped.
    pub fn submit(&self, payload: String) -> bool {
        match &self.submit {
            Some(submit) => submit.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop playback, close the speaker and discard anything not yet played.
    /// Idempotent.
    ///
    /// A decode already in flight finishes on the blocking pool, but its
    /// result goes nowhere.
    pub fn stop(&mut self) {
        self.submit.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.speaker.lock().close();
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_playback(
    speaker: SharedSpeaker,
    mut payloads: mpsc::UnboundedReceiver<String>,
    stats: Arc<CallStats>,
) {
    while let Some(payload) = payloads.recv().await {
        let decoded = tokio::task::spawn_blocking(move || decode_payload(&payload)).await;

        match decoded {
            Ok(Ok(clip)) => {
                let duration = clip.duration();
                let queued = speaker.lock().enqueue(clip);
                match queued {
                    Ok(()) => {
                        stats.record_chunk_played();
                        debug!(duration_ms = duration.as_millis() as u64, "Queued synthesized speech");
                    }
                    Err(e) => warn!(error = %e, "Speaker rejected clip"),
                }
            }
            Ok(Err(e)) => {
                stats.record_decode_failure();
                warn!(error = %e, "Dropping undecodable audio chunk");
            }
            Err(e) => {
                stats.record_decode_failure();
                error!(error = %e, "Audio decode task failed");
            }
        }
    }

    speaker.lock().close();
}

/// Output format negotiated with the device.
#[derive(Debug, Clone, Copy)]
struct OutputFormat {
    sample_rate: u32,
    channels: u16,
}

/// Speaker backed by a `cpal` output stream.
///
/// Clips are converted to the device format on enqueue and appended to a
/// shared sample queue; the output callback drains it and plays silence when
/// it runs dry.
pub struct CpalSpeaker {
    device_name: Option<String>,
    queue: Arc<Mutex<VecDeque<f32>>>,
    format: Option<OutputFormat>,
    stream: Option<StreamThread>,
}

impl CpalSpeaker {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            format: None,
            stream: None,
        }
    }
}

impl Speaker for CpalSpeaker {
    fn open(&mut self) -> AppResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device_name = self.device_name.clone();
        let queue = Arc::clone(&self.queue);
        let (stream, format) = StreamThread::spawn("grievance-playback", move || {
            open_output_stream(device_name.as_deref(), queue)
        })?;

        info!(
            sample_rate = format.sample_rate,
            channels = format.channels,
            "Speaker opened"
        );
        self.format = Some(format);
        self.stream = Some(stream);
        Ok(())
    }

    fn enqueue(&mut self, clip: PcmClip) -> AppResult<()> {
        let format = self
            .format
            .ok_or_else(|| AppError::Playback("Speaker is not open".to_string()))?;

        let mono = resample_linear(&clip.to_mono(), clip.sample_rate, format.sample_rate);
        let channels = format.channels.max(1) as usize;

        let mut queue = self.queue.lock();
        queue.reserve(mono.len() * channels);
        for sample in mono {
            for _ in 0..channels {
                queue.push_back(sample);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            info!("Speaker closed");
        }
        self.queue.lock().clear();
        self.format = None;
    }
}

impl Drop for CpalSpeaker {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_output_stream(
    device_name: Option<&str>,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> AppResult<(cpal::Stream, OutputFormat)> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| AppError::Playback(format!("Failed to list output devices: {}", e)))?;
    let device = select_device(devices, device_name, host.default_output_device(), "output")
        .map_err(AppError::Playback)?;

    let supported = device
        .default_output_config()
        .map_err(|e| AppError::Playback(format!("Failed to get output config: {}", e)))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, queue)?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, queue)?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, queue)?,
        other => {
            return Err(AppError::Playback(format!(
                "Unsupported output sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AppError::Playback(format!("Failed to start output stream: {}", e)))?;

    Ok((
        stream,
        OutputFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels,
        },
    ))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> AppResult<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock();
                for out in data.iter_mut() {
                    *out = T::from_sample(queue.pop_front().unwrap_or(0.0));
                }
            },
            |err| warn!(error = %err, "Output stream error"),
            None,
        )
        .map_err(|e| AppError::Playback(format!("Failed to build output stream: {}", e)))
}

/// Linear-interpolation resampler; good enough for speech.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = position.floor() as usize;
            let fraction = (position - index as f64) as f32;
            let a = samples[index.min(last)];
            let b = samples[(index + 1).min(last)];
            a + (b - a) * fraction
        })
        .collect()
}
