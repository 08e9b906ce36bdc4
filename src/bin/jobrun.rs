//! jobrun CLI: operator interface to the execution store.

use clap::{Parser, Subcommand};
use jobrun_rs::config::Config;
use jobrun_rs::db::Db;
use jobrun_rs::engine::Engine;
use jobrun_rs::model::ExecutionId;
use jobrun_rs::registry::JobRegistry;
use jobrun_rs::telemetry::{TelemetryConfig, init_telemetry};
use jobrun_rs::wire::{RawEventInput, SendEventOptions};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jobrun", about = "Event-triggered job execution with task replay")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations
    Migrate,
    /// Event operations
    Event {
        #[command(subcommand)]
        action: EventAction,
    },
    /// Execution operations
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
    /// Job definition operations
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum EventAction {
    /// Queue an event for delivery
    Send {
        /// Event name
        name: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Event id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
        /// Event source (configured default when omitted)
        #[arg(long)]
        source: Option<String>,
        /// Delay delivery by this many seconds
        #[arg(long)]
        deliver_after: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// Show an execution
    Show { id: String },
    /// List an execution's tasks in creation order
    Tasks { id: String },
    /// Abort a running or suspended execution
    Abort {
        id: String,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// Validate a directory of job definitions
    Check {
        #[arg(default_value = "jobs")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Jobs {
            action: JobsAction::Check { dir },
        } => cmd_jobs_check(dir),
        command => run_against_store(command).await,
    }
}

async fn run_against_store(command: Command) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let engine = Engine::builder(config.engine.clone())
        .store(Arc::new(db))
        .build();

    match command {
        Command::Migrate => {
            println!("Migrations applied.");
            Ok(())
        }
        Command::Event {
            action:
                EventAction::Send {
                    name,
                    payload,
                    id,
                    source,
                    deliver_after,
                },
        } => cmd_event_send(&engine, name, payload, id, source, deliver_after).await,
        Command::Execution { action } => match action {
            ExecutionAction::Show { id } => cmd_execution_show(&engine, id).await,
            ExecutionAction::Tasks { id } => cmd_execution_tasks(&engine, id).await,
            ExecutionAction::Abort { id, reason } => {
                let execution = engine
                    .coordinator()
                    .abort(&ExecutionId(id), &reason)
                    .await?;
                println!("Aborted: {} (state: {})", execution.id, execution.state);
                Ok(())
            }
        },
        Command::Jobs { .. } => Ok(()),
    }
}

async fn cmd_event_send(
    engine: &Engine,
    name: String,
    payload: Option<String>,
    id: Option<String>,
    source: Option<String>,
    deliver_after: Option<u64>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut event = RawEventInput::new(name, payload);
    if let Some(id) = id {
        event = event.id(id);
    }
    if let Some(source) = source {
        event = event.source(source);
    }

    let response = engine
        .router()
        .ingest(
            event,
            SendEventOptions {
                deliver_at: None,
                deliver_after,
            },
        )
        .await?;

    match response.deliver_at {
        Some(at) => println!("Queued: {} (deliver at {at})", response.id),
        None => println!("Queued: {}", response.id),
    }
    Ok(())
}

async fn cmd_execution_show(engine: &Engine, id: String) -> anyhow::Result<()> {
    let execution = engine.coordinator().get(&ExecutionId(id)).await?;

    println!("ID:         {}", execution.id);
    println!("Job:        {}", execution.job);
    println!("Event:      {} ({})", execution.event.id, execution.event.name);
    println!("State:      {}", execution.state);
    println!("Attempts:   {}", execution.attempts);
    println!("Env:        {}", execution.context.environment);
    println!("Created:    {}", execution.created_at);
    println!("Updated:    {}", execution.updated_at);
    if let Some(at) = execution.retry_at {
        println!("Retry At:   {at}");
    }
    if let Some(at) = execution.resume_at {
        println!("Resume At:  {at}");
    }
    if let Some(at) = execution.finished_at {
        println!("Finished:   {at}");
    }
    if let Some(ref output) = execution.output {
        println!("Output:     {}", serde_json::to_string_pretty(output)?);
    }
    if let Some(ref error) = execution.error {
        println!("Error:      [{}] {}", error.kind, error.message);
    }
    Ok(())
}

async fn cmd_execution_tasks(engine: &Engine, id: String) -> anyhow::Result<()> {
    let tasks = engine.coordinator().tasks(&ExecutionId(id)).await?;
    if tasks.is_empty() {
        println!("No tasks recorded.");
        return Ok(());
    }

    println!(
        "{:<4}  {:<32}  {:<24}  {:<10}  {:<3}  CREATED",
        "#", "KEY", "NAME", "STATUS", "TRY"
    );
    println!("{}", "-".repeat(100));
    for (n, task) in tasks.iter().enumerate() {
        println!(
            "{:<4}  {:<32}  {:<24}  {:<10}  {:<3}  {}",
            n + 1,
            truncate(&task.idempotency_key, 32),
            truncate(&task.name, 24),
            task.status.to_string(),
            task.attempts,
            task.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} task(s)", tasks.len());
    Ok(())
}

fn cmd_jobs_check(dir: PathBuf) -> anyhow::Result<()> {
    let registry = JobRegistry::load_from_dir(&dir)?;
    let jobs = registry.jobs()?;
    for job in &jobs {
        println!(
            "{:<40}  on {}{}",
            job.job_ref().to_string(),
            job.trigger.event,
            job.trigger
                .source
                .as_deref()
                .map(|s| format!(" from {s}"))
                .unwrap_or_default()
        );
    }
    println!("\n{} job(s) valid", jobs.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
