//! # Call Session
//!
//! The single owner of a call's lifecycle. Everything that happens during a call
//! (user commands, channel traffic, device failures, timers) arrives as a
//! [`SessionEvent`] on one queue and is applied by [`CallSession::handle`], one
//! event at a time. Nothing else mutates call state.
//!
//! ## Call Lifecycle:
//! ```text
//! Idle ──start()──▶ Connecting ──channel open + devices ready──▶ Active ──end()──▶ Idle
//!                       │                                          │
//!                       └──────────── failure / close ─────────────┴──▶ Ending ──▶ Idle
//! ```
//! - **Connecting**: once the channel opens, the microphone and speaker are opened
//!   on the blocking pool; messages that arrive meanwhile are held and applied on
//!   entering Active
//! - **Active**: the capture pipeline and playback scheduler run exactly while Active
//! - **Ending**: transient; resources are torn down and the session returns to Idle
//!   within the same step
//!
//! ## Generations:
//! Each `start()` bumps a generation number. Channel events, device setup, capture
//! failures, the inbound ring and the delayed ticket wipe carry the generation they
//! were created under; anything from an older call is ignored. Devices that come
//! back for a call that already ended are released unused.
//!
//! ## Projections:
//! After every event a [`SessionSnapshot`] is published on a `watch` channel. The
//! console renderer (or any other view) reads from there and never touches the session.

use crate::audio::backend::AudioBackend;
use crate::audio::capture::{CaptureErrorSink, CapturePipeline};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::CallDevices;
use crate::channel::{ChannelEvent, ChannelHandle, ChannelObserver, Dialer};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::grievance::{self, GrievanceTicket, IntelligenceLogEntry, TicketChange};
use crate::protocol::InboundEvent;
use crate::stats::CallStats;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Where the call is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Connecting,
    Active,
    Ending,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Active => "active",
            CallState::Ending => "ending",
        }
    }
}

/// Data-sovereignty indicator shown next to the data-point counter.
///
/// Priority: `Wiping` > `Processing` > `Sovereign`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SovereigntyStatus {
    Sovereign,
    Processing,
    Wiping,
}

/// Read-only view of the session, published after every event.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: CallState,
    pub call_id: Option<Uuid>,
    pub started_at: Option<DateTime<Local>>,
    /// Shared with the session until the next entry is appended
    pub log: Arc<Vec<IntelligenceLogEntry>>,
    pub ticket: GrievanceTicket,
    pub data_points_stored: u64,
    pub processing: bool,
    pub wiping: bool,
    /// Why the last call ended, if it ended on an error
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn sovereignty(&self) -> SovereigntyStatus {
        if self.wiping {
            SovereigntyStatus::Wiping
        } else if self.processing {
            SovereigntyStatus::Processing
        } else {
            SovereigntyStatus::Sovereign
        }
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            call_id: None,
            started_at: None,
            log: Arc::new(Vec::new()),
            ticket: GrievanceTicket::new(),
            data_points_stored: 0,
            processing: false,
            wiping: false,
            last_error: None,
        }
    }
}

/// User-facing commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Place a call (ignored unless Idle)
    Start,
    /// Hang up (ignored when Idle)
    End,
    /// Ring, then start, unless a call is already in progress
    SimulateInbound,
    /// End any call and stop the event loop
    Shutdown,
}

/// Everything the session reacts to.
#[derive(Debug)]
pub enum SessionEvent {
    Command(Command),
    Channel { generation: u64, event: ChannelEvent },
    DevicesReady { generation: u64, devices: AppResult<CallDevices> },
    CaptureFailed { generation: u64, error: String },
    WipeSettled { generation: u64 },
    RingElapsed { generation: u64 },
}

/// Timings and endpoints the session needs, resolved from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub channel_url: Url,
    pub frame_samples: usize,
    pub wipe_settle: Duration,
    pub inbound_ring: Duration,
}

impl CallSettings {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        Ok(Self {
            channel_url: config.channel_url()?,
            frame_samples: config.audio.frame_samples,
            wipe_settle: config.wipe_settle(),
            inbound_ring: config.inbound_ring(),
        })
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub fn start(&self) -> AppResult<()> {
        self.send(Command::Start)
    }

    pub fn end(&self) -> AppResult<()> {
        self.send(Command::End)
    }

    pub fn simulate_inbound(&self) -> AppResult<()> {
        self.send(Command::SimulateInbound)
    }

    pub fn shutdown(&self) -> AppResult<()> {
        self.send(Command::Shutdown)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that wakes on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    fn send(&self, command: Command) -> AppResult<()> {
        self.events
            .send(SessionEvent::Command(command))
            .map_err(|_| AppError::Internal("call session is no longer running".to_string()))
    }
}

/// Spawn a session event loop and return its handle.
pub fn spawn(
    settings: CallSettings,
    backend: Arc<dyn AudioBackend>,
    dialer: Arc<dyn Dialer>,
) -> (SessionHandle, JoinHandle<()>) {
    let (session, events_rx) = CallSession::new(settings, backend, dialer);
    let handle = session.handle();
    let task = tokio::spawn(session.run(events_rx));
    (handle, task)
}

/// The call state machine and everything it owns.
pub struct CallSession {
    settings: CallSettings,
    backend: Arc<dyn AudioBackend>,
    dialer: Arc<dyn Dialer>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    snapshot_tx: watch::Sender<SessionSnapshot>,

    state: CallState,
    generation: u64,
    call_id: Option<Uuid>,
    started_at: Option<DateTime<Local>>,
    ring_pending: bool,

    channel: Option<ChannelHandle>,
    channel_open: bool,
    held_messages: Vec<String>,
    capture: Option<CapturePipeline>,
    playback: Option<PlaybackScheduler>,
    stats: Arc<CallStats>,

    log: Arc<Vec<IntelligenceLogEntry>>,
    ticket: GrievanceTicket,
    data_points_stored: u64,
    processing: bool,
    wiping: bool,
    last_error: Option<String>,
}

impl CallSession {
    pub fn new(
        settings: CallSettings,
        backend: Arc<dyn AudioBackend>,
        dialer: Arc<dyn Dialer>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        let session = Self {
            settings,
            backend,
            dialer,
            events_tx,
            snapshot_tx,
            state: CallState::Idle,
            generation: 0,
            call_id: None,
            started_at: None,
            ring_pending: false,
            channel: None,
            channel_open: false,
            held_messages: Vec::new(),
            capture: None,
            playback: None,
            stats: Arc::new(CallStats::new()),
            log: Arc::new(Vec::new()),
            ticket: GrievanceTicket::new(),
            data_points_stored: 0,
            processing: false,
            wiping: false,
            last_error: None,
        };
        (session, events_rx)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            events: self.events_tx.clone(),
            snapshots: self.snapshot_tx.subscribe(),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Drain the event queue until a shutdown command arrives.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("Call session ready");
        while let Some(event) = events.recv().await {
            if matches!(event, SessionEvent::Command(Command::Shutdown)) {
                self.end();
                self.publish();
                break;
            }
            self.dispatch(event);
        }
        info!("Call session stopped");
    }

    /// Apply one event and publish the resulting snapshot.
    pub fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(Command::Start) => self.start(),
            SessionEvent::Command(Command::End) => self.end(),
            SessionEvent::Command(Command::SimulateInbound) => self.simulate_inbound(),
            SessionEvent::Command(Command::Shutdown) => self.end(),
            SessionEvent::Channel { generation, event } => self.on_channel(generation, event),
            SessionEvent::DevicesReady { generation, devices } => self.on_devices(generation, devices),
            SessionEvent::CaptureFailed { generation, error } => {
                let live = matches!(self.state, CallState::Connecting | CallState::Active);
                if generation == self.generation && live {
                    self.fail(AppError::Capture(error));
                } else {
                    debug!(generation, "Ignoring capture failure from a finished call");
                }
            }
            SessionEvent::WipeSettled { generation } => {
                if generation == self.generation {
                    self.ticket = GrievanceTicket::wiped();
                    info!(call_id = ?self.call_id, "Grievance ticket wiped");
                } else {
                    debug!(generation, "Ignoring wipe for a superseded call");
                }
            }
            SessionEvent::RingElapsed { generation } => {
                if generation != self.generation {
                    debug!(generation, "Ignoring ring that a placed call overtook");
                } else if self.state == CallState::Idle {
                    self.ring_pending = false;
                    info!("Inbound call connected");
                    self.start();
                } else {
                    self.ring_pending = false;
                    debug!(state = self.state.as_str(), "Ring elapsed while busy");
                }
            }
        }
        self.publish();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            call_id: self.call_id,
            started_at: self.started_at,
            log: Arc::clone(&self.log),
            ticket: self.ticket.clone(),
            data_points_stored: self.data_points_stored,
            processing: self.processing,
            wiping: self.wiping,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn transition(&mut self, next: CallState) {
        if self.state != next {
            info!(
                call_id = ?self.call_id,
                from = self.state.as_str(),
                to = next.as_str(),
                "Call state changed"
            );
            self.state = next;
        }
    }

    fn start(&mut self) {
        if self.state != CallState::Idle {
            warn!(state = self.state.as_str(), "Ignoring start: call already in progress");
            return;
        }

        self.generation += 1;
        self.ring_pending = false;
        self.call_id = Some(Uuid::new_v4());
        self.started_at = None;
        self.channel_open = false;
        self.held_messages.clear();
        self.stats = Arc::new(CallStats::new());
        self.log = Arc::new(Vec::new());
        self.ticket = GrievanceTicket::new();
        self.data_points_stored = 0;
        self.processing = false;
        self.wiping = false;
        self.last_error = None;

        self.transition(CallState::Connecting);

        let observer = self.channel_observer();
        self.channel = Some(self.dialer.dial(&self.settings.channel_url, observer));
    }

    fn end(&mut self) {
        match self.state {
            CallState::Idle => debug!("No call to end"),
            _ => {
                info!(call_id = ?self.call_id, "Hanging up");
                self.teardown();
                self.transition(CallState::Idle);
            }
        }
    }

    /// A fatal error: tear everything down and return to Idle in one step.
    fn fail(&mut self, err: AppError) {
        error!(call_id = ?self.call_id, kind = err.kind(), "Call failed: {}", err);
        self.last_error = Some(err.to_string());
        self.transition(CallState::Ending);
        self.teardown();
        self.transition(CallState::Idle);
    }

    fn simulate_inbound(&mut self) {
        if self.state != CallState::Idle || self.ring_pending {
            debug!(state = self.state.as_str(), "Ignoring inbound ring");
            return;
        }

        info!(ring_ms = self.settings.inbound_ring.as_millis() as u64, "Inbound call ringing");
        self.ring_pending = true;
        let events = self.events_tx.clone();
        let generation = self.generation;
        let ring = self.settings.inbound_ring;
        tokio::spawn(async move {
            tokio::time::sleep(ring).await;
            let _ = events.send(SessionEvent::RingElapsed { generation });
        });
    }

    fn on_channel(&mut self, generation: u64, event: ChannelEvent) {
        let live = generation == self.generation
            && matches!(self.state, CallState::Connecting | CallState::Active);
        if !live {
            debug!(generation, "Ignoring event from a closed channel");
            return;
        }

        match event {
            ChannelEvent::Opened if !self.channel_open => self.on_open(),
            ChannelEvent::Opened => debug!("Duplicate channel open"),
            ChannelEvent::Message(text) if self.state == CallState::Active => self.on_message(&text),
            ChannelEvent::Message(text) if self.channel_open => {
                debug!("Holding message until the devices are ready");
                self.held_messages.push(text);
            }
            ChannelEvent::Message(_) => debug!("Dropping message received before open"),
            ChannelEvent::Closed(reason) => {
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                self.fail(AppError::Channel(format!("closed by service: {}", reason)));
            }
            ChannelEvent::Failed(message) => self.fail(AppError::Channel(message)),
        }
    }

    /// Channel is up: open the devices off the event loop and stay Connecting
    /// until they report back.
    fn on_open(&mut self) {
        let outlet = match &self.channel {
            Some(channel) => channel.outlet(),
            None => {
                self.fail(AppError::Internal("open channel has no handle".to_string()));
                return;
            }
        };
        self.channel_open = true;
        debug!(call_id = ?self.call_id, "Channel open, acquiring audio devices");

        let backend = Arc::clone(&self.backend);
        let frame_samples = self.settings.frame_samples;
        let on_error = self.capture_error_sink();
        let stats = Arc::clone(&self.stats);
        let events = self.events_tx.clone();
        let generation = self.generation;
        tokio::task::spawn_blocking(move || {
            let devices = CallDevices::acquire(backend.as_ref(), outlet, frame_samples, on_error, stats);
            if let Err(unsent) = events.send(SessionEvent::DevicesReady { generation, devices }) {
                if let SessionEvent::DevicesReady { devices: Ok(devices), .. } = unsent.0 {
                    devices.release();
                }
            }
        });
    }

    fn on_devices(&mut self, generation: u64, devices: AppResult<CallDevices>) {
        if generation != self.generation || self.state != CallState::Connecting {
            debug!(generation, "Releasing devices opened for a finished call");
            if let Ok(devices) = devices {
                devices.release();
            }
            return;
        }

        let CallDevices { capture, speaker } = match devices {
            Ok(devices) => devices,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        self.transition(CallState::Active);
        self.started_at = Some(Local::now());
        self.processing = true;
        self.capture = Some(capture);

        match speaker {
            Ok(speaker) => {
                self.playback = Some(PlaybackScheduler::start(speaker, Arc::clone(&self.stats)));
            }
            Err(e) => error!(kind = e.kind(), "Playback unavailable, continuing without audio: {}", e),
        }

        for text in std::mem::take(&mut self.held_messages) {
            if self.state != CallState::Active {
                break;
            }
            self.on_message(&text);
        }
    }

    fn on_message(&mut self, text: &str) {
        self.stats.record_inbound_event();
        match InboundEvent::parse(text) {
            Ok(event) => self.apply_inbound(event),
            Err(e) => {
                self.stats.record_protocol_error();
                warn!(error = %e, "Ignoring unrecognized message");
            }
        }
    }

    /// Apply one parsed inbound event to the call projections.
    pub fn apply_inbound(&mut self, event: InboundEvent) {
        let received_at = Local::now();
        debug!(kind = event.kind(), "Inbound event");

        match &event {
            InboundEvent::TextChunk { category, label, text } => {
                if !grievance::is_recognized(*category, label) {
                    debug!(category = category.as_str(), label = %label, "Text chunk logged only");
                }
                Arc::make_mut(&mut self.log).push(IntelligenceLogEntry {
                    category: *category,
                    label: label.clone(),
                    text: text.clone(),
                    timestamp: received_at,
                });
            }
            InboundEvent::AudioChunk { audio } => match &self.playback {
                Some(playback) => {
                    playback.submit(audio.clone());
                }
                None => debug!("No playback running, dropping audio chunk"),
            },
            InboundEvent::DataCount { count } => self.data_points_stored = *count,
            InboundEvent::MemoryWipeStart => {
                info!(call_id = ?self.call_id, "Service wiping call memory");
                self.wiping = true;
            }
            InboundEvent::MemoryWipeComplete => {
                info!(call_id = ?self.call_id, "Service memory wipe complete");
                self.wiping = false;
                self.data_points_stored = 0;
            }
            InboundEvent::CallComplete => self.processing = false,
        }

        match grievance::reduce(&self.ticket, &event, received_at) {
            TicketChange::Replaced(ticket) => self.ticket = ticket,
            TicketChange::WipeRequested => self.schedule_wipe(),
            TicketChange::Unchanged => {}
        }
    }

    /// Clear the ticket after the settle delay. Survives hangup; a new call supersedes it.
    fn schedule_wipe(&self) {
        let events = self.events_tx.clone();
        let generation = self.generation;
        let settle = self.settings.wipe_settle;
        tokio::spawn(async move {
            tokio::time::sleep(settle).await;
            let _ = events.send(SessionEvent::WipeSettled { generation });
        });
    }

    fn teardown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.channel_open = false;
        self.held_messages.clear();

        self.processing = false;
        self.wiping = false;

        let stats = self.stats.snapshot();
        let duration_secs = self
            .started_at
            .map(|started| (Local::now() - started).num_seconds())
            .unwrap_or(0);
        info!(
            call_id = ?self.call_id,
            duration_secs,
            frames_sent = stats.frames_sent,
            frames_dropped = stats.frames_dropped,
            inbound_events = stats.inbound_events,
            protocol_errors = stats.protocol_errors,
            chunks_played = stats.chunks_played,
            decode_failures = stats.decode_failures,
            "Call summary"
        );

        self.call_id = None;
        self.started_at = None;
    }

    fn channel_observer(&self) -> ChannelObserver {
        let events = self.events_tx.clone();
        let generation = self.generation;
        Arc::new(move |event| {
            let _ = events.send(SessionEvent::Channel { generation, event });
        })
    }

    fn capture_error_sink(&self) -> CaptureErrorSink {
        let events = self.events_tx.clone();
        let generation = self.generation;
        Arc::new(move |err: AppError| {
            let _ = events.send(SessionEvent::CaptureFailed {
                generation,
                error: err.to_string(),
            });
        })
    }

    #[cfg(test)]
    fn capture_running(&self) -> bool {
        self.capture.as_ref().map(|c| c.is_running()).unwrap_or(false)
    }

    #[cfg(test)]
    fn playback_running(&self) -> bool {
        self.playback.as_ref().map(|p| p.is_running()).unwrap_or(false)
    }
}
