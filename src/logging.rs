//! Logging initialization for pipeline-tracker.
//!
//! With `logging.directory` set: logs to `{directory}/pipeline-tracker-{datetime}.log`
//! Otherwise: logs to stderr, keeping stdout free for step output and reports

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Result of logging initialization
pub struct LoggingHandle {
    /// Guard that must be kept alive for the duration of the program.
    /// When dropped, ensures all buffered logs are flushed.
    pub _guard: Option<WorkerGuard>,

    /// Path to the log file (only set when logging to a directory)
    pub log_file_path: Option<PathBuf>,
}

/// Effective filter directive: `RUST_LOG` wins, then `--debug`, then config
fn filter_directive(config: &Config, debug_override: bool, rust_log: Option<String>) -> String {
    match rust_log {
        Some(directive) if !directive.trim().is_empty() => directive,
        _ if debug_override => "debug".to_string(),
        _ => config.logging.level.clone(),
    }
}

fn log_file_name(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("pipeline-tracker-{}.log", now.format("%Y%m%dT%H%M%SZ"))
}

/// Initialize logging.
///
/// # Arguments
/// * `config` - Application configuration
/// * `debug_override` - If true, override log level to "debug" (from --debug flag)
///
/// # Returns
/// A `LoggingHandle` that must be kept alive for the duration of the program.
pub fn init_logging(config: &Config, debug_override: bool) -> Result<LoggingHandle> {
    let directive = filter_directive(config, debug_override, std::env::var("RUST_LOG").ok());
    let filter = tracing_subscriber::EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    match &config.logging.directory {
        Some(dir) => {
            let logs_dir = Path::new(dir);
            std::fs::create_dir_all(logs_dir)
                .with_context(|| format!("Failed to create log directory {}", dir))?;

            let log_filename = log_file_name(chrono::Utc::now());
            let log_file_path = logs_dir.join(&log_filename);

            let file_appender = tracing_appender::rolling::never(logs_dir, &log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false) // No ANSI codes in log files
                        .with_writer(non_blocking),
                )
                .init();

            Ok(LoggingHandle {
                _guard: Some(guard),
                log_file_path: Some(log_file_path),
            })
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();

            Ok(LoggingHandle {
                _guard: None,
                log_file_path: None,
            })
        }
    }
}
