//! Scripted in-memory transport and submitter shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use url::Url;

use pipeline_tracker::envelope::StepStatus;
use pipeline_tracker::stream::{Frame, Link, Transport, TransportError};
use pipeline_tracker::submission::{JobRequest, JobSubmitter, Submission, SubmissionError};

// ─── Links ────────────────────────────────────────────────────────────────────

/// Client side of an in-memory link
pub struct ChannelLink {
    inbound: mpsc::UnboundedReceiver<Frame>,
    sent: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    stall_close: Arc<AtomicBool>,
}

#[async_trait]
impl Link for ChannelLink {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.sent
            .send(text)
            .map_err(|_| TransportError::Send("server end dropped".into()))
    }

    async fn close(&mut self) {
        if self.stall_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Server side of an in-memory link. Dropping it drops the link.
pub struct ServerEnd {
    frames: mpsc::UnboundedSender<Frame>,
    sent: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
    stall_close: Arc<AtomicBool>,
}

impl ServerEnd {
    pub fn push_text(&self, text: &str) {
        let _ = self.frames.send(Frame::Text(text.to_string()));
    }

    pub fn push_json(&self, value: Value) {
        self.push_text(&value.to_string());
    }

    pub fn push_status(&self, step: &str, status: StepStatus) {
        self.push_json(status_json(step, status));
    }

    /// Frames the client has sent so far
    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            out.push(text);
        }
        out
    }

    /// Never answer the client's close handshake
    pub fn stall_close(&self) {
        self.stall_close.store(true, Ordering::SeqCst);
    }

    /// Whether the client closed the link gracefully
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub fn link_pair() -> (ChannelLink, ServerEnd) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let stall_close = Arc::new(AtomicBool::new(false));
    (
        ChannelLink {
            inbound: frames_rx,
            sent: sent_tx,
            closed: Arc::clone(&closed),
            stall_close: Arc::clone(&stall_close),
        },
        ServerEnd {
            frames: frames_tx,
            sent: sent_rx,
            closed,
            stall_close,
        },
    )
}

// ─── Transport ────────────────────────────────────────────────────────────────

/// Hands out queued links in order and refuses once the queue is empty
#[derive(Default)]
pub struct ScriptedTransport {
    links: Mutex<VecDeque<ChannelLink>>,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
    hang: AtomicBool,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a link for the next accepted connect
    pub fn accept_next(&self) -> ServerEnd {
        let (link, server) = link_pair();
        self.links.lock().unwrap().push_back(link);
        server
    }

    /// Make connects that find no queued link hang instead of failing
    pub fn hang_when_empty(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Link>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let next = self.links.lock().unwrap().pop_front();
        match next {
            Some(link) => Ok(Box::new(link)),
            None if self.hang.load(Ordering::SeqCst) => std::future::pending().await,
            None => Err(TransportError::Connect("connection refused".into())),
        }
    }
}

// ─── Submitter ────────────────────────────────────────────────────────────────

/// Returns queued submission outcomes in order
#[derive(Default)]
pub struct MockSubmitter {
    outcomes: Mutex<VecDeque<Result<Submission, SubmissionError>>>,
    requests: Mutex<Vec<Value>>,
}

impl MockSubmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn will_accept(&self, session_id: &str) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(Ok(Submission::new(session_id)));
    }

    pub fn will_fail(&self, err: SubmissionError) {
        self.outcomes.lock().unwrap().push_back(Err(err));
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSubmitter for MockSubmitter {
    async fn submit(&self, request: &JobRequest) -> Result<Submission, SubmissionError> {
        self.requests.lock().unwrap().push(request.intake.clone());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(SubmissionError::Network("no scripted outcome".into())))
    }
}

// ─── Payloads ─────────────────────────────────────────────────────────────────

pub fn status_json(step: &str, status: StepStatus) -> Value {
    json!({"type": "agent_status", "agent": step, "status": status.as_str()})
}

pub fn completion_json(report: Value) -> Value {
    json!({"type": "analysis_complete", "report": report})
}

/// Let spawned tasks run until they are all idle
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
