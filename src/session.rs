//! Session controller: submit a job, follow its stream, expose the live view.
//!
//! The step store lives inside the stream driver task (wrapped in a
//! [`StreamObserver`]), so it is only ever mutated from one place. Callers read
//! published [`SessionView`] snapshots through a `watch` channel.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::envelope::Envelope;
use crate::error::SessionError;
use crate::store::{ApplyOutcome, StepRecord, StepStore};
use crate::stream::{Connectivity, StreamConnection, StreamObserver, Transport};
use crate::submission::{JobRequest, JobSubmitter};

/// Read-only view of the active session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub session_id: String,
    /// Steps in order of first appearance
    pub steps: Vec<StepRecord>,
    pub current_phase: Option<String>,
    pub connectivity: Connectivity,
    /// Final report, once the job has completed
    pub result: Option<Value>,
}

impl SessionView {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            steps: Vec::new(),
            current_phase: None,
            connectivity: Connectivity::Idle,
            result: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    pub fn step(&self, key: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.key == key)
    }
}

/// Feeds decoded envelopes into the session's store and publishes snapshots
struct SessionSink {
    session_id: String,
    store: StepStore,
    view: watch::Sender<SessionView>,
}

impl StreamObserver for SessionSink {
    fn on_envelope(&mut self, envelope: Envelope) {
        match self.store.apply(envelope) {
            ApplyOutcome::Ignored(reason) => {
                debug!(session_id = %self.session_id, ?reason, "Envelope left session unchanged");
                return;
            }
            ApplyOutcome::Inserted { key, status } => {
                debug!(session_id = %self.session_id, step = %key, %status, "New step");
            }
            ApplyOutcome::Advanced { key, from, to } => {
                debug!(session_id = %self.session_id, step = %key, %from, %to, "Step advanced");
            }
            ApplyOutcome::Completed => {
                info!(session_id = %self.session_id, "Session result received");
            }
        }

        let snapshot = self.store.snapshot();
        self.view.send_modify(|view| {
            view.steps = snapshot.steps;
            view.current_phase = snapshot.current_phase;
            view.result = snapshot.result;
        });
    }

    fn on_connectivity(&mut self, state: Connectivity) {
        debug!(session_id = %self.session_id, %state, "Connectivity changed");
        self.view.send_modify(|view| view.connectivity = state);
    }
}

struct ActiveSession {
    session_id: String,
    connection: StreamConnection,
    view: watch::Receiver<SessionView>,
}

/// Façade over job submission, the stream connection and the step store.
///
/// Holds at most one session. A session stays active, even after its stream
/// has failed, until [`stop`](Self::stop) or [`replace`](Self::replace).
pub struct SessionController {
    submitter: Arc<dyn JobSubmitter>,
    transport: Arc<dyn Transport>,
    config: Config,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(
        submitter: Arc<dyn JobSubmitter>,
        transport: Arc<dyn Transport>,
        config: Config,
    ) -> Self {
        Self {
            submitter,
            transport,
            config,
            active: None,
        }
    }

    /// Submit a job and start following its stream. Returns the session id.
    pub async fn start(&mut self, request: &JobRequest) -> Result<String, SessionError> {
        self.ensure_idle()?;
        let submission = self.submitter.submit(request).await?;
        let url = self.stream_url(&submission.session_id)?;
        Ok(self.open(submission.session_id, url)?)
    }

    /// Follow an already-submitted session
    pub fn attach(&mut self, session_id: &str) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let url = self.stream_url(session_id)?;
        self.open(session_id.to_string(), url)?;
        Ok(())
    }

    /// Submit a new job and, once accepted, swap it in for the current session.
    ///
    /// If submission fails the current session is left running.
    pub async fn replace(&mut self, request: &JobRequest) -> Result<String, SessionError> {
        let submission = self.submitter.submit(request).await?;
        let url = self.stream_url(&submission.session_id)?;
        self.stop();
        Ok(self.open(submission.session_id, url)?)
    }

    /// Close the stream and discard the session. Returns whether one was active.
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.connection.close();
                info!(session_id = %active.session_id, "Session stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.session_id.as_str())
    }

    /// Current view of the active session
    pub fn view(&self) -> Option<SessionView> {
        let active = self.active.as_ref()?;
        let mut view = active.view.borrow().clone();
        // The connection's own state is updated synchronously on close
        view.connectivity = active.connection.connectivity();
        Some(view)
    }

    /// Subscribe to view updates of the active session
    pub fn subscribe(&self) -> Option<watch::Receiver<SessionView>> {
        self.active.as_ref().map(|a| a.view.clone())
    }

    /// Send a text frame on the session's stream; a no-op unless it is open
    pub fn send(&self, message: impl Into<String>) -> bool {
        match &self.active {
            Some(active) => active.connection.send(message),
            None => {
                warn!("Dropping outbound message: no active session");
                false
            }
        }
    }

    /// Wait for the session's result.
    ///
    /// Fails with `RetryExhausted` if the stream gives up first, or `Closed`
    /// if the stream is shut down before a result arrives.
    pub async fn wait_for_completion(&self) -> Result<Value, SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotRunning)?;
        let session_id = active.session_id.clone();
        let mut rx = active.view.clone();

        let outcome = match rx
            .wait_for(|v| v.result.is_some() || v.connectivity.is_terminal())
            .await
        {
            Ok(view) => match &view.result {
                Some(result) => Ok(result.clone()),
                None if view.connectivity == Connectivity::Failed => {
                    Err(SessionError::RetryExhausted { session_id })
                }
                None => Err(SessionError::Closed { session_id }),
            },
            Err(_) => Err(SessionError::Closed { session_id }),
        };
        outcome
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match &self.active {
            Some(active) => Err(SessionError::AlreadyRunning {
                session_id: active.session_id.clone(),
            }),
            None => Ok(()),
        }
    }

    fn stream_url(&self, session_id: &str) -> Result<Url, SessionError> {
        self.config
            .stream_url(session_id)
            .map_err(|e| SessionError::InvalidStreamUrl {
                session_id: session_id.to_string(),
                reason: format!("{:#}", e),
            })
    }

    fn open(&mut self, session_id: String, url: Url) -> Result<String, SessionError> {
        let (view_tx, view_rx) = watch::channel(SessionView::new(&session_id));
        let sink = SessionSink {
            session_id: session_id.clone(),
            store: StepStore::new(),
            view: view_tx,
        };

        let mut connection =
            StreamConnection::new(Arc::clone(&self.transport), self.config.stream_settings());
        connection.open(url.clone(), sink)?;

        info!(session_id = %session_id, url = %url, "Session started");
        self.active = Some(ActiveSession {
            session_id: session_id.clone(),
            connection,
            view: view_rx,
        });
        Ok(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CompletionEnvelope, StatusEnvelope, StepStatus};
    use serde_json::json;

    fn sink() -> (SessionSink, watch::Receiver<SessionView>) {
        let (tx, rx) = watch::channel(SessionView::new("s1"));
        (
            SessionSink {
                session_id: "s1".into(),
                store: StepStore::new(),
                view: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_sink_publishes_accepted_updates() {
        let (mut sink, rx) = sink();
        sink.on_envelope(
            StatusEnvelope::new("intake_specialist", StepStatus::Running)
                .with_phase("Data Collection")
                .into(),
        );

        let view = rx.borrow().clone();
        assert_eq!(view.steps.len(), 1);
        assert_eq!(view.current_phase.as_deref(), Some("Data Collection"));
        assert_eq!(
            view.step("intake_specialist").unwrap().status,
            StepStatus::Running
        );
    }

    #[test]
    fn test_sink_skips_publish_for_ignored_updates() {
        let (mut sink, mut rx) = sink();
        sink.on_envelope(StatusEnvelope::new("a", StepStatus::Completed).into());
        rx.borrow_and_update();

        sink.on_envelope(StatusEnvelope::new("a", StepStatus::Running).into());
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_sink_tracks_connectivity_and_result() {
        let (mut sink, rx) = sink();
        sink.on_connectivity(Connectivity::Open);
        sink.on_envelope(Envelope::Complete(CompletionEnvelope {
            report: json!({"urgency": "semi-urgent"}),
        }));

        let view = rx.borrow().clone();
        assert_eq!(view.connectivity, Connectivity::Open);
        assert!(view.is_complete());
        assert_eq!(view.result.unwrap()["urgency"], "semi-urgent");
    }
}
