//! Job definitions and trigger lookup.
//!
//! Each TOML file in a job directory defines one job version under a `[job]`
//! table. A version is immutable once registered; deprecating it stops new
//! executions from being created for it.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

use crate::error::{Error, Result};
use crate::model::{Job, JobRef, RawEvent};

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct JobFile {
    job: Job,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<JobRef, Job>,
    deprecated: HashSet<JobRef>,
}

/// Registered job versions, indexed by `(id, version)`.
#[derive(Debug, Default)]
pub struct JobRegistry {
    inner: RwLock<Inner>,
}

impl JobRegistry {
    /// Create an empty registry with no jobs.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let registry = Self::empty();

        let entries = std::fs::read_dir(dir)
            .map_err(|e| Error::Config(format!("cannot read job dir {}: {e}", dir.display())))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let file: JobFile = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("bad job definition {}: {e}", path.display())))?;
            registry.register(file.job).map_err(|e| {
                Error::Config(format!("invalid job definition {}: {e}", path.display()))
            })?;
        }

        Ok(registry)
    }

    /// Register a job version. Re-registering an identical definition is a
    /// no-op; changing an existing version is rejected.
    pub fn register(&self, job: Job) -> Result<()> {
        validate_job(&job)?;
        let job_ref = job.job_ref();
        let mut inner = self.write()?;
        if let Some(existing) = inner.jobs.get(&job_ref) {
            if *existing == job {
                return Ok(());
            }
            return Err(Error::Validation(format!(
                "job {job_ref} is already registered with a different definition"
            )));
        }
        info!(job = %job_ref, trigger = %job.trigger.event, "job registered");
        inner.jobs.insert(job_ref, job);
        Ok(())
    }

    pub fn get(&self, job: &JobRef) -> Result<Option<Job>> {
        Ok(self.read()?.jobs.get(job).cloned())
    }

    /// Active job versions whose trigger matches the event.
    pub fn matching(&self, event: &RawEvent) -> Result<Vec<Job>> {
        let inner = self.read()?;
        Ok(inner
            .jobs
            .iter()
            .filter(|(job_ref, job)| {
                !inner.deprecated.contains(*job_ref) && job.trigger.matches(event)
            })
            .map(|(_, job)| job.clone())
            .collect())
    }

    pub fn deprecate(&self, job: &JobRef) -> Result<()> {
        let mut inner = self.write()?;
        if !inner.jobs.contains_key(job) {
            return Err(Error::NotFound(format!("job {job}")));
        }
        if inner.deprecated.insert(job.clone()) {
            info!(job = %job, "job version deprecated");
        }
        Ok(())
    }

    pub fn is_deprecated(&self, job: &JobRef) -> Result<bool> {
        Ok(self.read()?.deprecated.contains(job))
    }

    pub fn jobs(&self) -> Result<Vec<Job>> {
        Ok(self.read()?.jobs.values().cloned().collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Other("job registry lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Other("job registry lock poisoned".to_string()))
    }
}

/// Structural checks on a job definition.
pub fn validate_job(job: &Job) -> Result<()> {
    for (field, value) in [
        ("id", &job.id),
        ("name", &job.name),
        ("version", &job.version),
        ("trigger.event", &job.trigger.event),
    ] {
        if value.trim().is_empty() {
            return Err(Error::Validation(format!("job {field} must not be empty")));
        }
    }

    let mut keys = HashSet::new();
    for connection in &job.connections {
        if connection.key.trim().is_empty() {
            return Err(Error::Validation(
                "connection key must not be empty".to_string(),
            ));
        }
        if !keys.insert(connection.key.as_str()) {
            return Err(Error::Validation(format!(
                "connection {} declared twice",
                connection.key
            )));
        }
    }

    if let Some(ref filter) = job.trigger.filter {
        validate_filter(filter, "filter")?;
    }
    Ok(())
}

fn validate_filter(filter: &serde_json::Value, path: &str) -> Result<()> {
    use serde_json::Value;

    let Value::Object(rules) = filter else {
        return Err(Error::Validation(format!("{path} must be an object")));
    };
    for (key, rule) in rules {
        match rule {
            Value::Array(_) => {}
            Value::Object(_) => validate_filter(rule, &format!("{path}.{key}"))?,
            _ => {
                return Err(Error::Validation(format!(
                    "{path}.{key} must be an array of values or a nested filter"
                )));
            }
        }
    }
    Ok(())
}
