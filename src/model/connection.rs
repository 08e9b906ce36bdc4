//! External connections and their resolved auth material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::job::ConnectionMetadata;
use crate::config::secrets::{SecretString, clone_secret, deserialize_secret, serialize_exposed};

/// Auth material handed to the worker for one connection key.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionAuth {
    #[serde(rename_all = "camelCase")]
    Oauth2 {
        #[serde(
            serialize_with = "serialize_exposed",
            deserialize_with = "deserialize_secret"
        )]
        access_token: SecretString,
        #[serde(default)]
        scopes: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        additional_fields: HashMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    ApiKey {
        #[serde(
            serialize_with = "serialize_exposed",
            deserialize_with = "deserialize_secret"
        )]
        api_key: SecretString,
    },
    /// The worker resolves credentials itself.
    Local,
}

impl Clone for ConnectionAuth {
    fn clone(&self) -> Self {
        match self {
            ConnectionAuth::Oauth2 {
                access_token,
                scopes,
                additional_fields,
            } => ConnectionAuth::Oauth2 {
                access_token: clone_secret(access_token),
                scopes: scopes.clone(),
                additional_fields: additional_fields.clone(),
            },
            ConnectionAuth::ApiKey { api_key } => ConnectionAuth::ApiKey {
                api_key: clone_secret(api_key),
            },
            ConnectionAuth::Local => ConnectionAuth::Local,
        }
    }
}

impl ConnectionAuth {
    pub fn is_local(&self) -> bool {
        matches!(self, ConnectionAuth::Local)
    }
}

/// Server-held credential for one connection in one environment.
#[derive(Debug, Clone)]
pub struct Credential {
    pub metadata: ConnectionMetadata,
    pub auth: ConnectionAuth,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
