use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipeline_tracker::config::Config;
use pipeline_tracker::envelope::StepStatus;
use pipeline_tracker::logging;
use pipeline_tracker::session::{SessionController, SessionView};
use pipeline_tracker::stream::{Connectivity, WsTransport};
use pipeline_tracker::submission::{Attachment, HttpJobClient, JobRequest};

#[derive(Parser)]
#[command(name = "pipeline-tracker")]
#[command(about = "Submit pipeline jobs and follow their live step status")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job and follow it until the report arrives
    Start {
        /// JSON file with the intake data
        #[arg(short, long)]
        intake: PathBuf,

        /// File to attach (repeatable)
        #[arg(short, long)]
        attach: Vec<PathBuf>,
    },

    /// Follow an already-submitted session
    Watch {
        /// Session id returned by the job server
        session_id: String,
    },

    /// Print the server's record of a session
    Session { session_id: String },

    /// List the agents the server runs
    Agents,

    /// Check server health
    Health,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first (needed for logging setup)
    let config = Config::load(cli.config.as_deref())?;

    let _logging_handle = logging::init_logging(&config, cli.debug)?;

    match cli.command {
        Commands::Start { intake, attach } => {
            cmd_start(config, &intake, &attach).await?;
        }
        Commands::Watch { session_id } => {
            cmd_watch(config, &session_id).await?;
        }
        Commands::Session { session_id } => {
            let client = http_client(&config)?;
            print_json(&client.get_session(&session_id).await?)?;
        }
        Commands::Agents => {
            cmd_agents(&config).await?;
        }
        Commands::Health => {
            let client = http_client(&config)?;
            print_json(&client.health().await?)?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

fn http_client(config: &Config) -> Result<HttpJobClient> {
    Ok(HttpJobClient::new(
        config.api.base_url.clone(),
        config.request_timeout(),
    )?)
}

fn controller(config: Config) -> Result<SessionController> {
    let client = http_client(&config)?;
    Ok(SessionController::new(
        Arc::new(client),
        Arc::new(WsTransport),
        config,
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_request(intake: &Path, attach: &[PathBuf]) -> Result<JobRequest> {
    let raw = tokio::fs::read_to_string(intake)
        .await
        .with_context(|| format!("Failed to read intake file {}", intake.display()))?;
    let intake: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Intake file {} is not valid JSON", intake.display()))?;

    let mut request = JobRequest::new(intake);
    for path in attach {
        let attachment = Attachment::from_path(path)
            .await
            .with_context(|| format!("Failed to read attachment {}", path.display()))?;
        request = request.with_attachment(attachment);
    }
    Ok(request)
}

async fn cmd_start(config: Config, intake: &Path, attach: &[PathBuf]) -> Result<()> {
    let request = load_request(intake, attach).await?;
    let mut controller = controller(config)?;

    let session_id = controller.start(&request).await?;
    println!("Session {}", session_id);
    println!("{}", "─".repeat(60));

    follow(&mut controller).await
}

async fn cmd_watch(config: Config, session_id: &str) -> Result<()> {
    let mut controller = controller(config)?;
    controller.attach(session_id)?;
    println!("Watching session {}", session_id);
    println!("{}", "─".repeat(60));

    follow(&mut controller).await
}

async fn cmd_agents(config: &Config) -> Result<()> {
    let catalog = http_client(config)?.list_agents().await?;

    if catalog.agents.is_empty() {
        println!("No agents configured");
        return Ok(());
    }

    println!("Pipeline Agents ({})", catalog.agents.len());
    println!("{}", "─".repeat(60));
    for agent in &catalog.agents {
        if agent.model.is_empty() {
            println!("{}", agent.name);
        } else {
            println!("{} [{}]", agent.name, agent.model);
        }
        if !agent.description.is_empty() {
            println!("    {}", agent.description);
        }
    }
    Ok(())
}

/// Tracks what has already been printed so only changes are shown
#[derive(Default)]
struct Printer {
    statuses: HashMap<String, StepStatus>,
    phase: Option<String>,
    connectivity: Option<Connectivity>,
}

impl Printer {
    fn print_changes(&mut self, view: &SessionView) {
        if self.connectivity != Some(view.connectivity) {
            if matches!(
                view.connectivity,
                Connectivity::Reconnecting | Connectivity::Failed
            ) {
                eprintln!("[stream {}]", view.connectivity);
            }
            self.connectivity = Some(view.connectivity);
        }

        if view.current_phase.is_some() && view.current_phase != self.phase {
            if let Some(phase) = &view.current_phase {
                println!("== {} ==", phase);
            }
            self.phase = view.current_phase.clone();
        }

        for step in &view.steps {
            if self.statuses.get(&step.key) == Some(&step.status) {
                continue;
            }
            let icon = match step.status {
                StepStatus::Queued => "·",
                StepStatus::Running => "▶",
                StepStatus::Completed => "✓",
                StepStatus::Error => "✗",
            };
            match step.confidence {
                Some(confidence) => println!(
                    "{} {} [{}] confidence {:.0}%",
                    icon,
                    step.key,
                    step.status,
                    confidence * 100.0
                ),
                None => println!("{} {} [{}]", icon, step.key, step.status),
            }
            self.statuses.insert(step.key.clone(), step.status);
        }
    }
}

/// Print step transitions until the report arrives or the stream gives up
async fn follow(controller: &mut SessionController) -> Result<()> {
    let mut rx = controller
        .subscribe()
        .context("No active session to follow")?;
    let mut printer = Printer::default();

    loop {
        let view = rx.borrow_and_update().clone();
        printer.print_changes(&view);

        if let Some(report) = &view.result {
            println!("{}", "─".repeat(60));
            print_json(report)?;
            controller.stop();
            return Ok(());
        }
        if view.connectivity == Connectivity::Failed {
            controller.stop();
            bail!(
                "Lost the stream for session {}: reconnect attempts exhausted",
                view.session_id
            );
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    let session_id = view.session_id.clone();
                    controller.stop();
                    bail!("Stream for session {} ended before a report arrived", session_id);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.stop();
                bail!("Interrupted");
            }
        }
    }
}
