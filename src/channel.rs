//! # Service Channel
//!
//! The full-duplex message channel between the client and the remote grievance
//! service, carried over a WebSocket.
//!
//! ## Key Features:
//! - **Observer callbacks**: open, message, close and failure are reported through a
//!   single [`ChannelObserver`], so the session can tag them with its call generation
//! - **Non-blocking writes**: capture frames go through [`FrameOutlet::offer`], which
//!   never waits; a frame that cannot be queued is dropped
//! - **Dialer seam**: the session only knows the [`Dialer`] trait, so tests can swap
//!   the network for an in-memory line
//!
//! ## Connection Flow:
//! 1. `dial()` spawns the connection task and returns a [`ChannelHandle`] immediately
//! 2. The task connects, flips the shared `open` flag and reports [`ChannelEvent::Opened`]
//! 3. Outbound records and inbound text frames are pumped until either side closes
//! 4. `close()` stops the task without reporting anything back

use crate::error::{AppError, AppResult};
use crate::protocol::OutboundEvent;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// What the connection task reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel is open; outbound frames are now accepted
    Opened,
    /// One inbound text frame, unparsed
    Message(String),
    /// The remote side closed the channel (optional close reason)
    Closed(Option<String>),
    /// The channel could not be opened or broke mid-call
    Failed(String),
}

/// Callback receiving channel events. Called from the connection task.
pub type ChannelObserver = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

/// Opens channels. Implemented by [`WebSocketDialer`] in production.
pub trait Dialer: Send + Sync {
    /// Begin opening a channel to `url`. Must not block; progress is reported to `observer`.
    fn dial(&self, url: &Url, observer: ChannelObserver) -> ChannelHandle;
}

/// Cloneable write side of an open channel, handed to the capture pipeline.
#[derive(Clone)]
pub struct FrameOutlet {
    outbound: mpsc::Sender<OutboundEvent>,
    open: Arc<AtomicBool>,
}

impl FrameOutlet {
    /// Queue a record for sending. Returns `false` (and drops the record) when the
    /// channel is not open or its outbound queue is full.
    pub fn offer(&self, event: OutboundEvent) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        self.outbound.try_send(event).is_ok()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Owner's handle on one channel.
///
/// At most one handle is live per session. Dropping the handle closes the channel.
pub struct ChannelHandle {
    outbound: mpsc::Sender<OutboundEvent>,
    open: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(
        outbound: mpsc::Sender<OutboundEvent>,
        open: Arc<AtomicBool>,
        shutdown: oneshot::Sender<()>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            open,
            shutdown: Some(shutdown),
            task,
        }
    }

    pub fn outlet(&self) -> FrameOutlet {
        FrameOutlet {
            outbound: self.outbound.clone(),
            open: Arc::clone(&self.open),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the channel. Idempotent; nothing is reported to the observer afterwards.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        // The task finishes on its own once it sees the shutdown signal.
        self.task.take();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the channel URL from the service origin, mirroring its scheme.
///
/// `http://host:8000` becomes `ws://host:8000/ws/call`, `https` becomes `wss`.
pub fn channel_url(origin: &Url, path: &str) -> AppResult<Url> {
    let scheme = match origin.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AppError::InvalidConfig(format!(
                "unsupported service origin scheme '{}'",
                other
            )))
        }
    };

    let mut url = origin.clone();
    url.set_scheme(scheme)
        .map_err(|_| AppError::InvalidConfig(format!("cannot use scheme '{}' for {}", scheme, origin)))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Dials the service over WebSocket using `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    connect_timeout: Duration,
    outbound_capacity: usize,
}

impl WebSocketDialer {
    pub fn new(connect_timeout: Duration, outbound_capacity: usize) -> Self {
        Self {
            connect_timeout,
            outbound_capacity: outbound_capacity.max(1),
        }
    }
}

impl Dialer for WebSocketDialer {
    fn dial(&self, url: &Url, observer: ChannelObserver) -> ChannelHandle {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_connection(
            url.to_string(),
            self.connect_timeout,
            outbound_rx,
            shutdown_rx,
            Arc::clone(&open),
            observer,
        ));

        ChannelHandle::new(outbound_tx, open, shutdown_tx, Some(task))
    }
}

/// Connection task: connect, then pump both directions until something closes.
async fn run_connection(
    url: String,
    connect_timeout: Duration,
    mut outbound_rx: mpsc::Receiver<OutboundEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    open: Arc<AtomicBool>,
    observer: ChannelObserver,
) {
    info!(url = %url, "Opening service channel");

    let connect = tokio::time::timeout(connect_timeout, connect_async(url.as_str()));
    let ws_stream = tokio::select! {
        _ = &mut shutdown_rx => {
            debug!("Channel closed before it opened");
            return;
        }
        result = connect => match result {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                observer(ChannelEvent::Failed(e.to_string()));
                return;
            }
            Err(_) => {
                observer(ChannelEvent::Failed(format!(
                    "no answer from {} within {:?}",
                    url, connect_timeout
                )));
                return;
            }
        }
    };

    open.store(true, Ordering::Release);
    info!(url = %url, "Service channel open");
    observer(ChannelEvent::Opened);

    let (mut sink, mut stream) = ws_stream.split();

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                open.store(false, Ordering::Release);
                let _ = sink.send(Message::Close(None)).await;
                debug!("Service channel closed locally");
                return;
            }
            outbound = outbound_rx.recv() => {
                let Some(event) = outbound else {
                    // Every writer is gone; treat like a local close.
                    open.store(false, Ordering::Release);
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Skipping unserializable outbound record");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    break ChannelEvent::Failed(e.to_string());
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => observer(ChannelEvent::Message(text)),
                Some(Ok(Message::Close(frame))) => {
                    break ChannelEvent::Closed(frame.map(|f| f.reason.to_string()));
                }
                Some(Ok(Message::Binary(data))) => {
                    debug!(bytes = data.len(), "Ignoring binary frame");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break ChannelEvent::Failed(e.to_string()),
                None => break ChannelEvent::Closed(None),
            }
        }
    };

    open.store(false, Ordering::Release);
    warn!(url = %url, outcome = ?outcome, "Service channel ended");
    observer(outcome);
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory dialer for session tests.

    use super::*;
    use parking_lot::Mutex;

    /// One dialed line: the test plays the service side through it.
    pub struct FakeLine {
        pub url: Url,
        observer: ChannelObserver,
        open: Arc<AtomicBool>,
        pub outbound: mpsc::Receiver<OutboundEvent>,
        shutdown: oneshot::Receiver<()>,
    }

    impl FakeLine {
        /// Service accepts the connection.
        pub fn open(&self) {
            self.open.store(true, Ordering::Release);
            (self.observer)(ChannelEvent::Opened);
        }

        /// Service sends one raw text frame.
        pub fn send_text(&self, text: &str) {
            (self.observer)(ChannelEvent::Message(text.to_string()));
        }

        /// Service closes or the transport breaks.
        pub fn report(&self, event: ChannelEvent) {
            self.open.store(false, Ordering::Release);
            (self.observer)(event);
        }

        /// Whether the client closed this line.
        pub fn was_closed(&mut self) -> bool {
            !matches!(self.shutdown.try_recv(), Err(oneshot::error::TryRecvError::Empty))
        }
    }

    #[derive(Default)]
    pub struct FakeDialer {
        lines: Mutex<Vec<FakeLine>>,
        capacity: usize,
    }

    impl FakeDialer {
        pub fn new(capacity: usize) -> Self {
            Self {
                lines: Mutex::new(Vec::new()),
                capacity,
            }
        }

        pub fn dial_count(&self) -> usize {
            self.lines.lock().len()
        }

        /// Take the most recently dialed line out of the dialer.
        pub fn take_line(&self) -> Option<FakeLine> {
            self.lines.lock().pop()
        }
    }

    impl Dialer for FakeDialer {
        fn dial(&self, url: &Url, observer: ChannelObserver) -> ChannelHandle {
            let (outbound_tx, outbound_rx) = mpsc::channel(self.capacity.max(1));
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let open = Arc::new(AtomicBool::new(false));

            self.lines.lock().push(FakeLine {
                url: url.clone(),
                observer,
                open: Arc::clone(&open),
                outbound: outbound_rx,
                shutdown: shutdown_rx,
            });

            ChannelHandle::new(outbound_tx, open, shutdown_tx, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn collecting_observer() -> (ChannelObserver, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer: ChannelObserver = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        (observer, rx)
    }

    #[test]
    fn test_channel_url_mirrors_origin_scheme() {
        let plain = channel_url(&Url::parse("http://localhost:8000").unwrap(), "/ws/call").unwrap();
        assert_eq!(plain.as_str(), "ws://localhost:8000/ws/call");

        let secure = channel_url(&Url::parse("https://grievance.example.org/app?x=1").unwrap(), "/ws/call")
            .unwrap();
        assert_eq!(secure.as_str(), "wss://grievance.example.org/ws/call");

        assert!(channel_url(&Url::parse("ftp://example.org").unwrap(), "/ws/call").is_err());
    }

    #[test]
    fn test_outlet_drops_frames_until_open() {
        let (tx, mut rx) = mpsc::channel(1);
        let (shutdown_tx, _shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));
        let mut handle = ChannelHandle::new(tx, Arc::clone(&open), shutdown_tx, None);
        let outlet = handle.outlet();

        let frame = || OutboundEvent::AudioChunk { audio: "AAAA".to_string() };
        assert!(!outlet.offer(frame()));

        open.store(true, Ordering::Release);
        assert!(outlet.offer(frame()));
        // Queue of one is now full
        assert!(!outlet.offer(frame()));
        assert!(rx.try_recv().is_ok());

        handle.close();
        assert!(!outlet.is_open());
        assert!(!outlet.offer(frame()));
    }

    #[tokio::test]
    async fn test_websocket_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();

            ws.send(Message::Text(
                r#"{"type":"text_chunk","category":"action","label":"Category","text":"Pothole"}"#.to_string(),
            ))
            .await
            .unwrap();

            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("Unexpected frame: {:?}", other),
                }
            };
            ws.close(None).await.unwrap();
            received
        });

        let (observer, mut events) = collecting_observer();
        let url = Url::parse(&format!("ws://{}/ws/call", addr)).unwrap();
        let handle = WebSocketDialer::new(Duration::from_secs(5), 4).dial(&url, observer);

        assert_eq!(events.recv().await, Some(ChannelEvent::Opened));
        assert!(handle.is_open());

        match events.recv().await {
            Some(ChannelEvent::Message(text)) => assert!(text.contains("Pothole")),
            other => panic!("Expected message, got {:?}", other),
        }

        assert!(handle.outlet().offer(OutboundEvent::AudioChunk { audio: "AAAAAA==".to_string() }));

        let received = server.await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(value["type"], "audio_chunk");
        assert_eq!(value["audio"], "AAAAAA==");

        assert!(matches!(events.recv().await, Some(ChannelEvent::Closed(_))));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_failure() {
        // Bind then drop to get a port nobody is listening on.
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let (observer, mut events) = collecting_observer();
        let url = Url::parse(&format!("ws://{}/ws/call", addr)).unwrap();

        let _handle = WebSocketDialer::new(Duration::from_secs(5), 4).dial(&url, observer);
        assert!(matches!(events.recv().await, Some(ChannelEvent::Failed(_))));
    }
}
