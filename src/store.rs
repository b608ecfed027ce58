//! Step state store: per-session reconciliation of step status updates.
//!
//! Delivery is at-most-once and may be duplicated or reordered, with no
//! sequence numbers. The store therefore only accepts forward status moves
//! (see [`StepStatus::can_advance_to`]) and converges to the same view no
//! matter how often an update is re-delivered.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

use crate::envelope::{Envelope, StatusEnvelope, StepStatus};

/// Current state of one pipeline step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub key: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Only set once the step has completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Producer output attached to the completing update
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn from_envelope(envelope: StatusEnvelope, at: DateTime<Utc>) -> Self {
        let mut record = Self {
            key: envelope.step.clone(),
            status: StepStatus::Queued,
            phase: None,
            confidence: None,
            output: None,
            started_at: None,
            ended_at: None,
        };
        record.enter(envelope, at);
        record
    }

    /// Move into the envelope's status. Callers have already checked that the
    /// move is forward (or that this is a fresh record).
    fn enter(&mut self, envelope: StatusEnvelope, at: DateTime<Utc>) {
        self.status = envelope.status;
        if envelope.phase.is_some() {
            self.phase = envelope.phase;
        }

        match envelope.status {
            StepStatus::Queued => {}
            StepStatus::Running => {
                self.started_at.get_or_insert(at);
            }
            StepStatus::Completed | StepStatus::Error => {
                // endedAt never precedes startedAt
                let ended = self.started_at.map_or(at, |started| started.max(at));
                self.ended_at.get_or_insert(ended);
                if envelope.status == StepStatus::Completed {
                    self.confidence = envelope.confidence;
                    self.output = envelope.output;
                }
            }
        }
    }

    /// Wall time spent running, once the step has ended
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Why an envelope left the store unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Same status the step already has
    Duplicate,
    /// Would move the step backward
    Regression,
    /// The session already has its result
    AfterCompletion,
    /// A second completion envelope
    DuplicateCompletion,
}

/// What `apply` did with an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First sighting of a step key
    Inserted { key: String, status: StepStatus },
    /// Existing step moved forward
    Advanced {
        key: String,
        from: StepStatus,
        to: StepStatus,
    },
    /// The session result was recorded
    Completed,
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    /// Whether the store was mutated
    pub fn changed(&self) -> bool {
        !matches!(self, ApplyOutcome::Ignored(_))
    }
}

/// Read-only view of a store
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Snapshot {
    /// Steps in order of first appearance
    pub steps: Vec<StepRecord>,
    pub current_phase: Option<String>,
    pub result: Option<Value>,
}

impl Snapshot {
    /// Look up a step by key
    pub fn step(&self, key: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.key == key)
    }

    /// Number of steps in a terminal status
    pub fn finished_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status.is_terminal()).count()
    }
}

/// Ordered, keyed table of step records for one session
#[derive(Debug, Default)]
pub struct StepStore {
    /// step key -> position in `steps`
    index: HashMap<String, usize>,
    steps: Vec<StepRecord>,
    current_phase: Option<String>,
    result: Option<Value>,
}

impl StepStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an envelope at the current time
    pub fn apply(&mut self, envelope: Envelope) -> ApplyOutcome {
        self.apply_at(envelope, Utc::now())
    }

    /// Apply an envelope as if it arrived at `at`
    pub fn apply_at(&mut self, envelope: Envelope, at: DateTime<Utc>) -> ApplyOutcome {
        if self.result.is_some() {
            let reason = match envelope {
                Envelope::Complete(_) => IgnoreReason::DuplicateCompletion,
                Envelope::Status(_) => IgnoreReason::AfterCompletion,
            };
            debug!(kind = envelope.kind(), "Ignoring envelope after completion");
            return ApplyOutcome::Ignored(reason);
        }

        match envelope {
            Envelope::Complete(complete) => {
                self.result = Some(complete.report);
                ApplyOutcome::Completed
            }
            Envelope::Status(status) => self.apply_status(status, at),
        }
    }

    fn apply_status(&mut self, envelope: StatusEnvelope, at: DateTime<Utc>) -> ApplyOutcome {
        let phase = envelope.phase.clone();

        let outcome = match self.index.get(&envelope.step) {
            None => {
                let key = envelope.step.clone();
                let status = envelope.status;
                self.index.insert(key.clone(), self.steps.len());
                self.steps.push(StepRecord::from_envelope(envelope, at));
                ApplyOutcome::Inserted { key, status }
            }
            Some(&pos) => {
                let record = &mut self.steps[pos];
                let from = record.status;
                if from == envelope.status {
                    debug!(step = %record.key, status = %from, "Duplicate status update");
                    return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
                }
                if !from.can_advance_to(envelope.status) {
                    debug!(
                        step = %record.key,
                        from = %from,
                        to = %envelope.status,
                        "Discarding status regression"
                    );
                    return ApplyOutcome::Ignored(IgnoreReason::Regression);
                }
                let to = envelope.status;
                record.enter(envelope, at);
                ApplyOutcome::Advanced {
                    key: record.key.clone(),
                    from,
                    to,
                }
            }
        };

        if phase.is_some() {
            self.current_phase = phase;
        }
        outcome
    }

    /// Steps in order of first appearance
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn get(&self, key: &str) -> Option<&StepRecord> {
        self.index.get(key).map(|&pos| &self.steps[pos])
    }

    pub fn current_phase(&self) -> Option<&str> {
        self.current_phase.as_deref()
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            steps: self.steps.clone(),
            current_phase: self.current_phase.clone(),
            result: self.result.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CompletionEnvelope;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn status(step: &str, status: StepStatus) -> Envelope {
        StatusEnvelope::new(step, status).into()
    }

    fn complete(report: Value) -> Envelope {
        Envelope::Complete(CompletionEnvelope { report })
    }

    #[test]
    fn test_queued_running_completed_sequence() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Queued), at(0));
        store.apply_at(status("a", StepStatus::Running), at(1));
        let outcome = store.apply_at(
            StatusEnvelope::new("a", StepStatus::Completed)
                .with_confidence(0.9)
                .into(),
            at(5),
        );

        assert_eq!(
            outcome,
            ApplyOutcome::Advanced {
                key: "a".into(),
                from: StepStatus::Running,
                to: StepStatus::Completed,
            }
        );
        let record = store.get("a").unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert_eq!(record.confidence, Some(0.9));
        assert_eq!(record.started_at, Some(at(1)));
        assert_eq!(record.ended_at, Some(at(5)));
        assert_eq!(record.duration(), Some(chrono::Duration::seconds(4)));
    }

    #[test]
    fn test_late_running_after_completed_is_discarded() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Completed), at(0));
        let before = store.get("a").cloned();

        let outcome = store.apply_at(status("a", StepStatus::Running), at(1));

        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::Regression));
        assert_eq!(store.get("a").cloned(), before);
        assert_eq!(store.get("a").unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let mut store = StepStore::new();
        let env: Envelope = StatusEnvelope::new("a", StepStatus::Running)
            .with_phase("Data Collection")
            .into();

        store.apply_at(env.clone(), at(0));
        let once = store.snapshot();
        let outcome = store.apply_at(env, at(10));

        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::Duplicate));
        assert_eq!(store.snapshot(), once);
    }

    #[test]
    fn test_terminal_states_do_not_replace_each_other() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Error), at(0));
        let outcome = store.apply_at(status("a", StepStatus::Completed), at(1));
        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::Regression));
        assert_eq!(store.get("a").unwrap().status, StepStatus::Error);
    }

    #[test]
    fn test_skipping_forward_is_allowed() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Queued), at(0));
        let outcome = store.apply_at(status("a", StepStatus::Completed), at(3));
        assert!(outcome.changed());

        let record = store.get("a").unwrap();
        assert_eq!(record.started_at, None);
        assert_eq!(record.ended_at, Some(at(3)));
    }

    #[test]
    fn test_insert_running_sets_started_at() {
        let mut store = StepStore::new();
        let outcome = store.apply_at(status("a", StepStatus::Running), at(2));
        assert_eq!(
            outcome,
            ApplyOutcome::Inserted {
                key: "a".into(),
                status: StepStatus::Running,
            }
        );
        assert_eq!(store.get("a").unwrap().started_at, Some(at(2)));
        assert_eq!(store.get("a").unwrap().ended_at, None);
    }

    #[test]
    fn test_ended_at_never_precedes_started_at() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Running), at(10));
        store.apply_at(status("a", StepStatus::Error), at(5));
        let record = store.get("a").unwrap();
        assert_eq!(record.ended_at, Some(at(10)));
    }

    #[test]
    fn test_confidence_and_output_only_on_completed() {
        let mut store = StepStore::new();
        store.apply_at(
            StatusEnvelope::new("a", StepStatus::Running)
                .with_confidence(0.4)
                .with_output(json!("partial"))
                .into(),
            at(0),
        );
        let record = store.get("a").unwrap();
        assert_eq!(record.confidence, None);
        assert_eq!(record.output, None);

        store.apply_at(
            StatusEnvelope::new("a", StepStatus::Completed)
                .with_confidence(0.8)
                .with_output(json!("done"))
                .into(),
            at(1),
        );
        let record = store.get("a").unwrap();
        assert_eq!(record.confidence, Some(0.8));
        assert_eq!(record.output, Some(json!("done")));
    }

    #[test]
    fn test_display_order_is_first_appearance() {
        let mut store = StepStore::new();
        store.apply_at(status("b", StepStatus::Queued), at(0));
        store.apply_at(status("a", StepStatus::Queued), at(0));
        store.apply_at(status("b", StepStatus::Completed), at(1));
        store.apply_at(status("c", StepStatus::Running), at(2));

        let keys: Vec<_> = store.steps().iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_current_phase_last_write_wins_on_accepted_updates() {
        let mut store = StepStore::new();
        store.apply_at(
            StatusEnvelope::new("a", StepStatus::Running)
                .with_phase("Orchestration")
                .into(),
            at(0),
        );
        store.apply_at(
            StatusEnvelope::new("b", StepStatus::Running)
                .with_phase("Data Collection")
                .into(),
            at(1),
        );
        assert_eq!(store.current_phase(), Some("Data Collection"));

        // A stale re-delivery does not rewind the label
        store.apply_at(
            StatusEnvelope::new("a", StepStatus::Running)
                .with_phase("Orchestration")
                .into(),
            at(2),
        );
        assert_eq!(store.current_phase(), Some("Data Collection"));

        // An update without a phase keeps the current label
        store.apply_at(status("b", StepStatus::Completed), at(3));
        assert_eq!(store.current_phase(), Some("Data Collection"));
        assert_eq!(store.get("b").unwrap().phase.as_deref(), Some("Data Collection"));
    }

    #[test]
    fn test_completion_lock() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Running), at(0));
        assert_eq!(
            store.apply_at(complete(json!({"urgency": "urgent"})), at(1)),
            ApplyOutcome::Completed
        );
        let locked = store.snapshot();

        assert_eq!(
            store.apply_at(complete(json!({"urgency": "non-urgent"})), at(2)),
            ApplyOutcome::Ignored(IgnoreReason::DuplicateCompletion)
        );
        assert_eq!(
            store.apply_at(status("a", StepStatus::Completed), at(3)),
            ApplyOutcome::Ignored(IgnoreReason::AfterCompletion)
        );
        assert_eq!(
            store.apply_at(status("z", StepStatus::Queued), at(4)),
            ApplyOutcome::Ignored(IgnoreReason::AfterCompletion)
        );

        assert_eq!(store.snapshot(), locked);
        assert!(store.is_complete());
        assert_eq!(store.result().unwrap()["urgency"], "urgent");
    }

    #[test]
    fn test_snapshot_helpers() {
        let mut store = StepStore::new();
        store.apply_at(status("a", StepStatus::Completed), at(0));
        store.apply_at(status("b", StepStatus::Running), at(0));
        store.apply_at(status("c", StepStatus::Error), at(0));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.finished_count(), 2);
        assert_eq!(snapshot.step("b").unwrap().status, StepStatus::Running);
        assert!(snapshot.step("missing").is_none());
    }
}
