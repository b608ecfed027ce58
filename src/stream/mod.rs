//! Stream connection: lifecycle of one event stream for one session.
//!
//! States: `Idle -> Connecting -> Open -> {Closed, Reconnecting} -> (Connecting | Failed)`.
//!
//! A single driver task owns the link and the observer. Every frame, state
//! change and backoff wait is handled there one at a time, so the observer is
//! never called concurrently. The [`StreamConnection`] handle only flips the
//! shared state to `Closed` and wakes the driver.

pub mod backoff;
pub mod transport;

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::envelope::{self, Envelope};

pub use backoff::ReconnectPolicy;
pub use transport::{Frame, Link, Transport, TransportError, WsTransport};

/// Keepalive frame understood by the job server
pub const PING_FRAME: &str = "ping";

/// The server's reply to [`PING_FRAME`]
pub const PONG_FRAME: &str = "pong";

/// Connectivity state of a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Shut down by the caller
    Closed,
    /// Reconnect attempts exhausted
    Failed,
}

impl Connectivity {
    /// No further transitions happen from a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Connectivity::Closed | Connectivity::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Connectivity::Idle => "idle",
            Connectivity::Connecting => "connecting",
            Connectivity::Open => "open",
            Connectivity::Reconnecting => "reconnecting",
            Connectivity::Closed => "closed",
            Connectivity::Failed => "failed",
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives everything a stream connection produces.
///
/// Called from the connection's driver task, one event at a time.
pub trait StreamObserver: Send + 'static {
    /// One call per successfully decoded frame
    fn on_envelope(&mut self, envelope: Envelope);

    /// Called on every state the connection enters after `Idle`
    fn on_connectivity(&mut self, _state: Connectivity) {}
}

/// Tunables for one stream connection
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub policy: ReconnectPolicy,
    /// Upper bound for a single connection attempt
    pub connect_timeout: Duration,
    /// Send [`PING_FRAME`] at this interval while open
    pub ping_interval: Option<Duration>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            ping_interval: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream connection cannot be opened from state '{0}'")]
    AlreadyOpened(Connectivity),
}

/// State shared between the handle and the driver task
struct Shared {
    state: watch::Sender<Connectivity>,
    shutdown: Notify,
}

impl Shared {
    /// Move to `next` unless a terminal state was already entered
    fn transition(&self, next: Connectivity) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    fn current(&self) -> Connectivity {
        *self.state.borrow()
    }
}

/// Handle to one stream connection.
///
/// Dropping the handle closes the connection.
pub struct StreamConnection {
    transport: Arc<dyn Transport>,
    settings: StreamSettings,
    shared: Arc<Shared>,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Option<mpsc::UnboundedReceiver<String>>,
    url: Option<Url>,
    task: Option<JoinHandle<()>>,
}

impl StreamConnection {
    pub fn new(transport: Arc<dyn Transport>, settings: StreamSettings) -> Self {
        let (state, _) = watch::channel(Connectivity::Idle);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            settings,
            shared: Arc::new(Shared {
                state,
                shutdown: Notify::new(),
            }),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            url: None,
            task: None,
        }
    }

    /// Start the lifecycle against `url`. Only valid from `Idle`.
    ///
    /// Must be called inside a tokio runtime; the driver runs as a spawned task.
    pub fn open<O: StreamObserver>(&mut self, url: Url, observer: O) -> Result<(), StreamError> {
        let state = self.shared.current();
        let outbound = match self.outbound_rx.take() {
            Some(rx) if state == Connectivity::Idle => rx,
            Some(rx) => {
                self.outbound_rx = Some(rx);
                return Err(StreamError::AlreadyOpened(state));
            }
            None => return Err(StreamError::AlreadyOpened(state)),
        };

        let driver = Driver {
            transport: Arc::clone(&self.transport),
            settings: self.settings.clone(),
            shared: Arc::clone(&self.shared),
            url: url.clone(),
            observer,
            outbound,
        };
        self.url = Some(url);
        self.task = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Shut the connection down. Idempotent.
    ///
    /// The state flips to `Closed` before this returns, so pending backoff
    /// waits and in-flight attempts are abandoned and `send` becomes a no-op.
    /// A connection that already `Failed` stays `Failed`.
    pub fn close(&self) {
        let closed = self.shared.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = Connectivity::Closed;
                true
            }
        });
        if closed {
            info!(url = ?self.url.as_ref().map(Url::as_str), "Stream connection closed");
        }
        self.shared.shutdown.notify_one();
    }

    /// Queue a text frame for the open link.
    ///
    /// Returns `false` (and logs a warning) unless the connection is `Open`.
    pub fn send(&self, message: impl Into<String>) -> bool {
        let state = self.shared.current();
        if state != Connectivity::Open {
            warn!(state = %state, "Dropping outbound message: stream is not open");
            return false;
        }
        self.outbound_tx.send(message.into()).is_ok()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.shared.current()
    }

    /// Watch connectivity changes
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.shared.state.subscribe()
    }

    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Wait until the connection is `Closed` or `Failed`
    pub async fn terminated(&self) -> Connectivity {
        let mut rx = self.subscribe();
        let state = match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.shared.current(),
        };
        state
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// How a link's receive loop ended
enum LinkEnd {
    Shutdown,
    Dropped,
}

struct Driver<O> {
    transport: Arc<dyn Transport>,
    settings: StreamSettings,
    shared: Arc<Shared>,
    url: Url,
    observer: O,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl<O: StreamObserver> Driver<O> {
    async fn run(mut self) {
        let policy = self.settings.policy.clone();
        let mut schedule = policy.schedule();
        let mut attempts: u32 = 0;

        loop {
            if !self.enter(Connectivity::Connecting) {
                break;
            }
            attempts += 1;
            info!(url = %self.url, attempt = attempts, "Connecting to stream");

            let timeout = self.settings.connect_timeout;
            let connect = tokio::time::timeout(timeout, self.transport.connect(&self.url));
            let result = tokio::select! {
                biased;
                () = self.shared.shutdown.notified() => break,
                result = connect => result.unwrap_or(Err(TransportError::Timeout(timeout))),
            };

            // An attempt that resolves after close is discarded
            if self.shared.current().is_terminal() {
                if let Ok(mut link) = result {
                    close_link(&mut *link, &self.url, self.settings.connect_timeout).await;
                }
                break;
            }

            match result {
                Ok(link) => {
                    attempts = 0;
                    schedule = policy.schedule();
                    if !self.enter(Connectivity::Open) {
                        break;
                    }
                    info!(url = %self.url, "Stream open");
                    if let LinkEnd::Shutdown = self.pump(link).await {
                        break;
                    }
                }
                Err(err) => {
                    warn!(url = %self.url, attempt = attempts, error = %err, "Stream connect failed");
                }
            }

            if !policy.allows_retry(attempts) {
                if self.enter(Connectivity::Failed) {
                    error!(url = %self.url, attempts, "Stream reconnect attempts exhausted");
                }
                break;
            }

            let delay = schedule.next_delay();
            if !self.enter(Connectivity::Reconnecting) {
                break;
            }
            info!(
                delay_ms = delay.as_millis() as u64,
                next_attempt = attempts + 1,
                "Waiting before reconnect"
            );
            tokio::select! {
                biased;
                () = self.shared.shutdown.notified() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        if self.shared.current() == Connectivity::Closed {
            self.observer.on_connectivity(Connectivity::Closed);
        }
        debug!(url = %self.url, state = %self.shared.current(), "Stream driver stopped");
    }

    /// Enter `next` and tell the observer; `false` once the connection is terminal
    fn enter(&mut self, next: Connectivity) -> bool {
        if !self.shared.transition(next) {
            return false;
        }
        self.observer.on_connectivity(next);
        true
    }

    async fn pump(&mut self, mut link: Box<dyn Link>) -> LinkEnd {
        let mut ping = self
            .settings
            .ping_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        let end = loop {
            tokio::select! {
                biased;
                () = self.shared.shutdown.notified() => break LinkEnd::Shutdown,
                Some(message) = self.outbound.recv() => {
                    if let Err(err) = link.send(message).await {
                        warn!(error = %err, "Stream send failed");
                        break LinkEnd::Dropped;
                    }
                }
                () = next_tick(&mut ping) => {
                    trace!("Sending keepalive ping");
                    if let Err(err) = link.send(PING_FRAME.to_string()).await {
                        warn!(error = %err, "Stream keepalive failed");
                        break LinkEnd::Dropped;
                    }
                }
                frame = link.recv() => match frame {
                    Some(Ok(frame)) => self.deliver(frame),
                    Some(Err(err)) => {
                        warn!(url = %self.url, error = %err, "Stream transport error");
                        break LinkEnd::Dropped;
                    }
                    None => {
                        info!(url = %self.url, "Stream closed by remote");
                        break LinkEnd::Dropped;
                    }
                },
            }
        };

        if let LinkEnd::Shutdown = end {
            close_link(&mut *link, &self.url, self.settings.connect_timeout).await;
        }
        // Messages queued for this link are not replayed on the next one
        while self.outbound.try_recv().is_ok() {}
        end
    }

    fn deliver(&mut self, frame: Frame) {
        if self.shared.current().is_terminal() {
            return;
        }
        let decoded = match frame {
            Frame::Text(text) if text.trim() == PONG_FRAME => {
                trace!("Keepalive pong");
                return;
            }
            Frame::Text(text) => envelope::decode(&text),
            Frame::Binary(bytes) => envelope::decode_bytes(&bytes),
        };
        match decoded {
            Ok(envelope) => self.observer.on_envelope(envelope),
            Err(err) => warn!(url = %self.url, error = %err, "Dropping undecodable stream frame"),
        }
    }
}

/// Graceful close, bounded so a peer that stops reading cannot hold the driver
async fn close_link(link: &mut dyn Link, url: &Url, limit: Duration) {
    if tokio::time::timeout(limit, link.close()).await.is_err() {
        warn!(url = %url, timeout = ?limit, "Stream close handshake timed out");
    }
}

async fn next_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
