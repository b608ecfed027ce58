use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::stream::{ReconnectPolicy, StreamSettings};

/// Placeholder substituted with the session id in [`ApiConfig::stream_path`]
pub const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Job server endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// REST base URL of the job server
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Stream base URL; derived from `base_url` (http -> ws) when unset
    #[serde(default)]
    pub stream_base_url: Option<String>,
    /// Stream path template, must contain `{session_id}`
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
    /// Timeout in seconds for REST calls (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_stream_path() -> String {
    format!("/ws/{}", SESSION_ID_PLACEHOLDER)
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            stream_base_url: None,
            stream_path: default_stream_path(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// Stream connection and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Consecutive connection attempts before giving up; 0 retries forever (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First reconnect delay in milliseconds, doubled per attempt (default: 3000)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Reconnect delay ceiling in milliseconds (default: 30000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Timeout in seconds for a single connection attempt (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Keepalive ping interval in seconds; 0 disables (default: 0)
    #[serde(default)]
    pub ping_interval_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    3000 // 3 seconds
}

fn default_max_delay() -> u64 {
    30_000 // 30 seconds
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            connect_timeout_secs: default_connect_timeout(),
            ping_interval_secs: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[serde(default)]
    pub directory: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
        }
    }
}

impl Config {
    /// User config in ~/.config/pipeline-tracker/
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pipeline-tracker").join("config.toml"))
    }

    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // Start with embedded defaults so the tracker works without config files
        let defaults = Config::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize default config")?;

        let mut builder = config::Config::builder().add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(user_config) = Self::user_config_path() {
            if user_config.exists() {
                builder = builder.add_source(config::File::from(user_config));
            }
        }

        // Explicit config file (CLI override)
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment variables with PIPELINE_TRACKER_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("PIPELINE_TRACKER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to load configuration")?;
        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.api.stream_path.contains(SESSION_ID_PLACEHOLDER) {
            bail!(
                "api.stream_path '{}' must contain {}",
                self.api.stream_path,
                SESSION_ID_PLACEHOLDER
            );
        }
        self.stream_base_url()?;
        Ok(())
    }

    /// Render as TOML (for `pipeline-tracker config`)
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Base URL for stream connections
    pub fn stream_base_url(&self) -> Result<Url> {
        let raw = match &self.api.stream_base_url {
            Some(url) => url.clone(),
            None => {
                let base = self.api.base_url.as_str();
                if let Some(rest) = base.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = base.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    base.to_string()
                }
            }
        };
        Url::parse(&raw).with_context(|| format!("Invalid stream base URL '{}'", raw))
    }

    /// Stream URL for one session.
    ///
    /// The id is opaque: it always lands in a single percent-encoded path
    /// segment, whatever characters it contains.
    pub fn stream_url(&self, session_id: &str) -> Result<Url> {
        if matches!(session_id, "" | "." | "..") {
            bail!("Session id '{}' cannot be used as a path segment", session_id);
        }
        let (prefix, suffix) = self
            .api
            .stream_path
            .split_once(SESSION_ID_PLACEHOLDER)
            .with_context(|| {
                format!(
                    "api.stream_path '{}' must contain {}",
                    self.api.stream_path, SESSION_ID_PLACEHOLDER
                )
            })?;

        let mut url = self.stream_base_url()?;
        let base = url.to_string();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| anyhow!("Stream base URL '{}' cannot take a path", base))?;
            segments.pop_if_empty();
            segments.extend(prefix.split('/').filter(|s| !s.is_empty()));
            segments.push(session_id);
            segments.extend(suffix.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            (self.stream.max_attempts > 0).then_some(self.stream.max_attempts),
            Duration::from_millis(self.stream.base_delay_ms),
            Duration::from_millis(self.stream.max_delay_ms),
        )
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            policy: self.reconnect_policy(),
            connect_timeout: Duration::from_secs(self.stream.connect_timeout_secs),
            ping_interval: (self.stream.ping_interval_secs > 0)
                .then(|| Duration::from_secs(self.stream.ping_interval_secs)),
        }
    }
}
