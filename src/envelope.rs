//! Envelope codec for the job event stream.
//!
//! Every inbound frame carries one JSON object tagged by its `type` field:
//! - `agent_status`: a step (agent) status update
//! - `analysis_complete`: the terminal payload carrying the final report
//!
//! Decoding never panics; malformed frames come back as [`DecodeError`] so the
//! stream can log and drop them without closing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Wire tag for step status updates
pub const STATUS_KIND: &str = "agent_status";

/// Wire tag for the terminal completion payload
pub const COMPLETE_KIND: &str = "analysis_complete";

/// Lifecycle status of a single pipeline step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    /// Position along `queued -> running -> {completed|error}`
    pub fn rank(self) -> u8 {
        match self {
            StepStatus::Queued => 0,
            StepStatus::Running => 1,
            StepStatus::Completed | StepStatus::Error => 2,
        }
    }

    /// Whether a step in this status may move to `next`.
    ///
    /// Only strictly forward moves are allowed. `completed` and `error` are
    /// both terminal, so neither replaces the other.
    pub fn can_advance_to(self, next: StepStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Whether this status ends the step
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Queued => "queued",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step status update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    /// Step key (the agent name on the wire)
    #[serde(rename = "agent")]
    pub step: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Producer confidence in `[0, 1]`, meaningful only for `completed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Opaque step output (usually a short summary)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Producer-side timestamp, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl StatusEnvelope {
    /// Build a bare status update for `step`
    pub fn new(step: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step: step.into(),
            status,
            phase: None,
            confidence: None,
            output: None,
            timestamp: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// The terminal payload; `report` is opaque to this crate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    pub report: Value,
}

/// One decoded unit of the event stream
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Status(StatusEnvelope),
    Complete(CompletionEnvelope),
}

impl Envelope {
    /// Wire tag of this envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Status(_) => STATUS_KIND,
            Envelope::Complete(_) => COMPLETE_KIND,
        }
    }

    /// Encode back to the wire format
    pub fn to_json(&self) -> Value {
        let (kind, body) = match self {
            Envelope::Status(status) => (STATUS_KIND, serde_json::to_value(status)),
            Envelope::Complete(complete) => (COMPLETE_KIND, serde_json::to_value(complete)),
        };
        let mut body = body.unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = &mut body {
            map.insert("type".to_string(), Value::String(kind.to_string()));
        }
        body
    }
}

impl From<StatusEnvelope> for Envelope {
    fn from(status: StatusEnvelope) -> Self {
        Envelope::Status(status)
    }
}

/// Why an inbound frame could not be decoded
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("envelope has no `type` field")]
    MissingKind,

    #[error("unknown envelope type '{0}'")]
    UnknownKind(String),

    #[error("invalid agent_status payload: {0}")]
    InvalidPayload(String),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Decode a text frame into an envelope
pub fn decode(text: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Value::Object(mut map) = value else {
        return Err(DecodeError::Malformed("expected a JSON object".into()));
    };

    let kind = match map.remove("type") {
        Some(Value::String(kind)) => kind,
        Some(_) => {
            return Err(DecodeError::InvalidField {
                field: "type",
                reason: "expected a string".into(),
            })
        }
        None => return Err(DecodeError::MissingKind),
    };

    match kind.as_str() {
        STATUS_KIND => decode_status(Value::Object(map)).map(Envelope::Status),
        COMPLETE_KIND => decode_completion(map).map(Envelope::Complete),
        _ => Err(DecodeError::UnknownKind(kind)),
    }
}

/// Decode a binary frame; the payload must be UTF-8 JSON
pub fn decode_bytes(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;
    decode(text)
}

fn decode_status(value: Value) -> Result<StatusEnvelope, DecodeError> {
    let envelope: StatusEnvelope = serde_json::from_value(value)
        .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;

    if envelope.step.trim().is_empty() {
        return Err(DecodeError::InvalidField {
            field: "agent",
            reason: "step key must not be empty".into(),
        });
    }

    if let Some(confidence) = envelope.confidence {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(DecodeError::InvalidField {
                field: "confidence",
                reason: format!("{} is outside [0, 1]", confidence),
            });
        }
    }

    Ok(envelope)
}

fn decode_completion(
    mut map: serde_json::Map<String, Value>,
) -> Result<CompletionEnvelope, DecodeError> {
    match map.remove("report") {
        Some(Value::Null) | None => Err(DecodeError::InvalidField {
            field: "report",
            reason: "completion envelope carries no report".into(),
        }),
        Some(report) => Ok(CompletionEnvelope { report }),
    }
}
