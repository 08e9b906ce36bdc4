//! HTTP event sources: inbound webhook calls become raw events.
//!
//! A forwarding proxy calls in with the `x-trigger-*` headers describing the
//! original request. The adapter authenticates the call against the
//! registered source's secret and emits exactly one event through the
//! router.

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::config::secrets::{ExposeSecret, SecretString, clone_secret};
use crate::engine::Router;
use crate::error::{Error, Result};
use crate::wire::{RawEventInput, SendEventBody, SendEventOptions, SendEventResponse};

pub const HEADER_KEY: &str = "x-trigger-key";
pub const HEADER_AUTH: &str = "x-trigger-auth";
pub const HEADER_URL: &str = "x-trigger-url";
pub const HEADER_METHOD: &str = "x-trigger-method";
pub const HEADER_HEADERS: &str = "x-trigger-headers";
pub const HEADER_SECRET: &str = "x-trigger-secret";

/// A registered inbound webhook endpoint.
#[derive(Debug)]
pub struct HttpEventSource {
    pub id: String,
    /// Emitted events are named after the key.
    pub key: String,
    pub url: String,
    pub secret: Option<SecretString>,
    pub active: bool,
    pub connection_id: Option<String>,
}

impl Clone for HttpEventSource {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            key: self.key.clone(),
            url: self.url.clone(),
            secret: self.secret.as_ref().map(clone_secret),
            active: self.active,
            connection_id: self.connection_id.clone(),
        }
    }
}

impl HttpEventSource {
    /// Headers a forwarding proxy sends for a request to this source.
    pub fn sign(
        &self,
        method: impl Into<String>,
        headers: HashMap<String, String>,
        auth: Option<serde_json::Value>,
    ) -> SourceRequestHeaders {
        SourceRequestHeaders {
            key: self.key.clone(),
            auth,
            url: self.url.clone(),
            method: method.into(),
            headers,
            secret: self.secret.as_ref().map(clone_secret),
        }
    }

    fn verify(&self, presented: Option<&SecretString>) -> Result<()> {
        let Some(ref expected) = self.secret else {
            return Ok(());
        };
        let Some(presented) = presented else {
            return Err(Error::Unauthorized(format!(
                "missing {HEADER_SECRET} for source {}",
                self.key
            )));
        };
        let matches: bool = expected
            .expose_secret()
            .as_bytes()
            .ct_eq(presented.expose_secret().as_bytes())
            .into();
        if !matches {
            return Err(Error::Unauthorized(format!(
                "{HEADER_SECRET} does not match source {}",
                self.key
            )));
        }
        Ok(())
    }
}

/// The `x-trigger-*` header set.
#[derive(Debug)]
pub struct SourceRequestHeaders {
    pub key: String,
    /// Serialized auth descriptor of the original request.
    pub auth: Option<serde_json::Value>,
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub secret: Option<SecretString>,
}

impl SourceRequestHeaders {
    /// Parse from request headers. Header names are matched
    /// case-insensitively.
    pub fn parse(raw: &HashMap<String, String>) -> Result<Self> {
        let lookup: HashMap<String, &str> = raw
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
            .collect();
        let required = |name: &str| -> Result<String> {
            lookup
                .get(name)
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.to_string())
                .ok_or_else(|| Error::Validation(format!("missing header {name}")))
        };

        let headers = match lookup.get(HEADER_HEADERS) {
            Some(encoded) => serde_json::from_str(encoded).map_err(|e| {
                Error::Validation(format!("{HEADER_HEADERS} is not a JSON string map: {e}"))
            })?,
            None => HashMap::new(),
        };
        let auth = lookup
            .get(HEADER_AUTH)
            .map(|encoded| {
                serde_json::from_str(encoded)
                    .map_err(|e| Error::Validation(format!("{HEADER_AUTH} is not JSON: {e}")))
            })
            .transpose()?;

        Ok(Self {
            key: required(HEADER_KEY)?,
            auth,
            url: required(HEADER_URL)?,
            method: required(HEADER_METHOD)?.to_ascii_uppercase(),
            headers,
            secret: lookup
                .get(HEADER_SECRET)
                .map(|s| SecretString::from(s.to_string())),
        })
    }

    /// Render as header pairs, secret included.
    pub fn to_headers(&self) -> Result<Vec<(String, String)>> {
        let mut out = vec![
            (HEADER_KEY.to_string(), self.key.clone()),
            (HEADER_URL.to_string(), self.url.clone()),
            (HEADER_METHOD.to_string(), self.method.clone()),
            (
                HEADER_HEADERS.to_string(),
                serde_json::to_string(&self.headers)?,
            ),
        ];
        if let Some(ref auth) = self.auth {
            out.push((HEADER_AUTH.to_string(), serde_json::to_string(auth)?));
        }
        if let Some(ref secret) = self.secret {
            out.push((HEADER_SECRET.to_string(), secret.expose_secret().to_string()));
        }
        Ok(out)
    }
}

/// Turns authenticated inbound calls into events, stamped with the
/// configured HTTP event source.
pub struct HttpSourceAdapter {
    sources: RwLock<HashMap<String, HttpEventSource>>,
    router: Arc<Router>,
}

impl HttpSourceAdapter {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
            router,
        }
    }

    /// Register or replace the source for its key.
    pub fn register(&self, source: HttpEventSource) -> Result<()> {
        self.sources
            .write()
            .map_err(|_| Error::Other("source table lock poisoned".to_string()))?
            .insert(source.key.clone(), source);
        Ok(())
    }

    fn source(&self, key: &str) -> Result<HttpEventSource> {
        self.sources
            .read()
            .map_err(|_| Error::Other("source table lock poisoned".to_string()))?
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Unauthorized(format!("unknown source {key}")))
    }

    /// Authenticate an inbound call and emit its event.
    pub async fn accept(
        &self,
        raw_headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<SendEventResponse> {
        let request = SourceRequestHeaders::parse(raw_headers)?;
        let source = self.source(&request.key)?;
        if !source.active {
            warn!(source = %source.key, "call to inactive source rejected");
            return Err(Error::Unauthorized(format!(
                "source {} is inactive",
                source.key
            )));
        }
        if let Err(e) = source.verify(request.secret.as_ref()) {
            warn!(source = %source.key, "call with bad secret rejected");
            return Err(e);
        }

        let body = match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(value) => value,
            Err(_) => serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
        };
        let mut event = RawEventInput::new(
            source.key.clone(),
            json!({
                "url": request.url,
                "method": request.method,
                "headers": request.headers,
                "body": body,
            }),
        )
        .source(self.router.config().http_event_source.clone());
        event.context = Some(json!({
            "sourceId": source.id,
            "connectionId": source.connection_id,
        }));

        let response = self
            .router
            .send(SendEventBody {
                event,
                options: SendEventOptions::default(),
            })
            .await?;
        info!(source = %source.key, event_id = %response.id, "webhook accepted");
        Ok(response)
    }
}
