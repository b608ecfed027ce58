//! Job submission: the collaborator that turns intake data into a session id.
//!
//! [`JobSubmitter`] is the seam the session controller depends on.
//! [`HttpJobClient`] implements it against the job server's REST API, which
//! also exposes a few read-only endpoints (session record, agent catalogue,
//! health) used by the CLI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Errors from the job submission collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error("job server unreachable: {0}")]
    Network(String),

    #[error("job server returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("unexpected response from job server: {0}")]
    InvalidResponse(String),
}

/// Binary attachment sent alongside the intake data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let content_type = guess_content_type(&file_name).map(str::to_string);
        Self {
            file_name,
            content_type,
            bytes,
        }
    }

    /// Read an attachment from disk
    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::new(file_name, bytes))
    }
}

fn guess_content_type(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name)
        .extension()?
        .to_string_lossy()
        .to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

/// A job-start request. The intake payload is opaque here.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub intake: Value,
    pub attachments: Vec<Attachment>,
}

impl JobRequest {
    pub fn new(intake: Value) -> Self {
        Self {
            intake,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Accepted job, as reported by the job server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub session_id: String,
    #[serde(default)]
    pub status: Option<String>,
    /// Server-relative stream path, informational
    #[serde(default)]
    pub websocket_url: Option<String>,
}

impl Submission {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: None,
            websocket_url: None,
        }
    }
}

/// Submits jobs and hands back the session id to stream from
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, request: &JobRequest) -> Result<Submission, SubmissionError>;
}

/// One agent in the server's pipeline catalogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCatalog {
    pub agents: Vec<AgentInfo>,
    #[serde(default)]
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub active_sessions: u64,
}

/// REST client for the job server
pub struct HttpJobClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJobClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SubmissionError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pipeline-tracker/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Raw session record kept by the server
    #[instrument(skip(self))]
    pub async fn get_session(&self, session_id: &str) -> Result<Value, SubmissionError> {
        self.get_json(&format!("session/{}", session_id)).await
    }

    /// Agents the server can run
    pub async fn list_agents(&self) -> Result<AgentCatalog, SubmissionError> {
        self.get_json("agents").await
    }

    pub async fn health(&self) -> Result<HealthStatus, SubmissionError> {
        self.get_json("health").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, SubmissionError> {
        let url = self.endpoint(path);
        debug!(url = %url, "GET");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SubmissionError::Network(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, SubmissionError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SubmissionError::Http {
                status: status.as_u16(),
                message: error_detail(&body),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SubmissionError::InvalidResponse(e.to_string()))
    }

    fn build_form(request: &JobRequest) -> Result<reqwest::multipart::Form, SubmissionError> {
        let intake = serde_json::to_string(&request.intake)
            .map_err(|e| SubmissionError::InvalidRequest(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new().text("intake", intake);

        for attachment in &request.attachments {
            let mut part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
                .file_name(attachment.file_name.clone());
            if let Some(content_type) = &attachment.content_type {
                part = part
                    .mime_str(content_type)
                    .map_err(|e| SubmissionError::InvalidRequest(e.to_string()))?;
            }
            form = form.part("images", part);
        }
        Ok(form)
    }
}

#[async_trait]
impl JobSubmitter for HttpJobClient {
    async fn submit(&self, request: &JobRequest) -> Result<Submission, SubmissionError> {
        debug!(attachments = request.attachments.len(), "Submitting job");
        let form = Self::build_form(request)?;
        let response = self
            .client
            .post(self.endpoint("analyze"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| SubmissionError::Network(e.to_string()))?;

        let submission: Submission = Self::parse_response(response).await?;
        if submission.session_id.trim().is_empty() {
            return Err(SubmissionError::InvalidResponse(
                "response carries an empty session_id".into(),
            ));
        }
        info!(session_id = %submission.session_id, "Job submitted");
        Ok(submission)
    }
}

/// Pull `detail` out of an error body when the server sends one
fn error_detail(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}
