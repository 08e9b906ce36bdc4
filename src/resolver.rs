//! Connection auth resolution.
//!
//! Turns a job's declared connections into the auth material handed to the
//! worker. Credential storage lives behind [`ConnectionResolver`];
//! [`InMemoryCredentials`] backs tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{ConnectionAuth, Credential, JobConnection};

#[async_trait]
pub trait ConnectionResolver: Send + Sync {
    /// Resolve every connection for `environment`, keyed by connection key.
    ///
    /// Connections using local auth resolve to [`ConnectionAuth::Local`].
    async fn resolve(
        &self,
        connections: &[JobConnection],
        environment: &str,
    ) -> Result<HashMap<String, ConnectionAuth>>;
}

/// Credentials keyed by `(environment, connection key)`.
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    credentials: RwLock<HashMap<(String, String), Credential>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        environment: impl Into<String>,
        key: impl Into<String>,
        credential: Credential,
    ) -> Result<()> {
        self.credentials
            .write()
            .map_err(|_| Error::Other("credential lock poisoned".to_string()))?
            .insert((environment.into(), key.into()), credential);
        Ok(())
    }

    pub fn remove(&self, environment: &str, key: &str) -> Result<Option<Credential>> {
        Ok(self
            .credentials
            .write()
            .map_err(|_| Error::Other("credential lock poisoned".to_string()))?
            .remove(&(environment.to_string(), key.to_string())))
    }

    fn resolve_at(
        &self,
        connections: &[JobConnection],
        environment: &str,
        now: DateTime<Utc>,
    ) -> Result<HashMap<String, ConnectionAuth>> {
        let credentials = self
            .credentials
            .read()
            .map_err(|_| Error::Other("credential lock poisoned".to_string()))?;

        let mut resolved = HashMap::with_capacity(connections.len());
        for connection in connections {
            if connection.uses_local_auth {
                resolved.insert(connection.key.clone(), ConnectionAuth::Local);
                continue;
            }
            let credential = credentials
                .get(&(environment.to_string(), connection.key.clone()))
                .ok_or_else(|| Error::ConnectionNotFound(connection.key.clone()))?;
            if credential.is_expired(now) {
                return Err(Error::AuthExpired {
                    key: connection.key.clone(),
                    expired_at: credential.expires_at.unwrap_or(now),
                });
            }
            resolved.insert(connection.key.clone(), credential.auth.clone());
        }
        debug!(environment, count = resolved.len(), "connections resolved");
        Ok(resolved)
    }
}

#[async_trait]
impl ConnectionResolver for InMemoryCredentials {
    async fn resolve(
        &self,
        connections: &[JobConnection],
        environment: &str,
    ) -> Result<HashMap<String, ConnectionAuth>> {
        self.resolve_at(connections, environment, Utc::now())
    }
}
