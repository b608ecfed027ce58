//! Pipeline Tracker - live status client for multi-agent pipeline jobs
//!
//! Submits a job, follows the server's event stream for the resulting
//! session, and reconciles out-of-order, duplicated and replayed status
//! updates into one ordered view of the pipeline's steps.

pub mod config;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod session;
pub mod store;
pub mod stream;
pub mod submission;

pub use config::Config;
pub use envelope::{CompletionEnvelope, Envelope, StatusEnvelope, StepStatus};
pub use error::SessionError;
pub use session::{SessionController, SessionView};
pub use store::{ApplyOutcome, StepRecord, StepStore};
pub use stream::{Connectivity, StreamConnection, StreamObserver, StreamSettings};
pub use submission::{HttpJobClient, JobRequest, JobSubmitter, Submission, SubmissionError};
