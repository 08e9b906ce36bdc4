//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use crate::engine::retry::RetryPolicy;
use crate::ledger::{DEFAULT_TASK_LEASE, DEFAULT_TASK_POLL};
use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Source stamped on events submitted without one.
    pub default_event_source: String,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let default_event_source = required_var("DEFAULT_EVENT_SOURCE")?;
        let mut engine = EngineConfig::new(default_event_source.clone());

        if let Some(environment) = optional_var("ENGINE_ENVIRONMENT") {
            engine.environment = environment;
        }
        if let Some(organization) = optional_var("ENGINE_ORGANIZATION") {
            engine.organization = organization;
        }
        if let Some(n) = parsed_var::<u32>("DELIVERY_MAX_ATTEMPTS")? {
            engine.delivery_retry.max_attempts = n;
        }
        if let Some(n) = parsed_var::<u32>("EXECUTION_MAX_ATTEMPTS")? {
            engine.execution_retry.max_attempts = n;
        }
        if let Some(secs) = parsed_var::<u64>("MAX_SUSPENSION_SECS")? {
            engine.max_suspension = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed_var::<u64>("SCHEDULER_POLL_MS")? {
            engine.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed_var::<u64>("TASK_LEASE_SECS")? {
            engine.task_lease = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed_var::<u64>("TASK_POLL_MS")? {
            engine.task_poll_interval = Duration::from_millis(ms);
        }
        if let Some(source) = optional_var("HTTP_EVENT_SOURCE") {
            engine.http_event_source = source;
        }

        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            default_event_source,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            engine,
        })
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub default_event_source: String,
    /// Source stamped on events emitted by HTTP sources.
    pub http_event_source: String,
    /// Stamped into every execution context.
    pub environment: String,
    pub organization: String,
    pub execution_retry: RetryPolicy,
    pub delivery_retry: RetryPolicy,
    /// Suspended executions older than this are failed by the scheduler.
    pub max_suspension: Duration,
    pub poll_interval: Duration,
    /// Upper bound on events delivered per scheduler tick.
    pub delivery_batch: usize,
    /// Lease a ledger holds on a running task; renewed while the side effect
    /// runs, taken over by another ledger once lapsed.
    pub task_lease: Duration,
    /// Poll period while waiting on a task leased elsewhere.
    pub task_poll_interval: Duration,
}

impl EngineConfig {
    pub fn new(default_event_source: impl Into<String>) -> Self {
        Self {
            default_event_source: default_event_source.into(),
            http_event_source: "http".to_string(),
            environment: "development".to_string(),
            organization: "default".to_string(),
            execution_retry: RetryPolicy::execution_default(),
            delivery_retry: RetryPolicy::delivery_default(),
            max_suspension: Duration::from_secs(7 * 24 * 60 * 60),
            poll_interval: Duration::from_secs(1),
            delivery_batch: 100,
            task_lease: DEFAULT_TASK_LEASE,
            task_poll_interval: DEFAULT_TASK_POLL,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
