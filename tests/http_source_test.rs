//! Webhook intake: authentication and event emission.

use chrono::Utc;
use jobrun_rs::config::EngineConfig;
use jobrun_rs::engine::Engine;
use jobrun_rs::error::Error;
use jobrun_rs::http_source::{
    HEADER_KEY, HEADER_SECRET, HttpEventSource, HttpSourceAdapter, SourceRequestHeaders,
};
use jobrun_rs::store::Store;
use secrecy::SecretString;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn github_source(secret: Option<&str>) -> HttpEventSource {
    HttpEventSource {
        id: "src_1".into(),
        key: "github.push".into(),
        url: "https://hooks.example.com/github".into(),
        secret: secret.map(|s| SecretString::from(s.to_string())),
        active: true,
        connection_id: Some("conn_1".into()),
    }
}

fn headers(source: &HttpEventSource) -> HashMap<String, String> {
    let mut forwarded = HashMap::new();
    forwarded.insert("content-type".to_string(), "application/json".to_string());
    source
        .sign("post", forwarded, None)
        .to_headers()
        .unwrap()
        .into_iter()
        .collect()
}

fn adapter() -> (Engine, HttpSourceAdapter) {
    let mut config = EngineConfig::new("app");
    config.http_event_source = "webhooks".into();
    let engine = Engine::builder(config).build();
    let adapter = HttpSourceAdapter::new(Arc::clone(engine.router()));
    (engine, adapter)
}

#[tokio::test]
async fn matching_secret_emits_exactly_one_event() {
    let (engine, adapter) = adapter();
    let source = github_source(Some("s3cr3t"));
    adapter.register(source.clone()).unwrap();

    let before = Utc::now();
    let response = adapter
        .accept(&headers(&source), br#"{"ref":"refs/heads/main"}"#)
        .await
        .unwrap();
    assert!(response.delivered_at.is_some());

    let due = engine
        .store()
        .due_events(Utc::now() + chrono::Duration::days(1), 10)
        .await
        .unwrap();
    assert!(due.is_empty(), "event was delivered as part of the call");

    let log = engine.store().get_event(&response.id).await.unwrap();
    assert_eq!(log.event.name, "github.push");
    assert_eq!(log.event.source, "webhooks", "configured source tag");
    assert!(log.event.timestamp >= before);
    assert_eq!(log.event.payload["method"], "POST");
    assert_eq!(log.event.payload["url"], "https://hooks.example.com/github");
    assert_eq!(
        log.event.payload["headers"]["content-type"],
        "application/json"
    );
    assert_eq!(log.event.payload["body"], json!({"ref": "refs/heads/main"}));
    assert_eq!(
        log.event.context,
        Some(json!({"sourceId": "src_1", "connectionId": "conn_1"}))
    );
}

#[tokio::test]
async fn missing_or_wrong_secret_is_unauthorized() {
    let (engine, adapter) = adapter();
    let source = github_source(Some("s3cr3t"));
    adapter.register(source.clone()).unwrap();

    let mut missing = headers(&source);
    missing.remove(HEADER_SECRET);
    let err = adapter.accept(&missing, b"{}").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    let mut wrong = headers(&source);
    wrong.insert(HEADER_SECRET.to_string(), "s3cr3T".to_string());
    let err = adapter.accept(&wrong, b"{}").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    let due = engine
        .store()
        .due_events(Utc::now() + chrono::Duration::days(1), 10)
        .await
        .unwrap();
    assert!(due.is_empty());
}

#[tokio::test]
async fn unknown_or_inactive_source_is_unauthorized() {
    let (_engine, adapter) = adapter();
    let mut source = github_source(None);

    let err = adapter.accept(&headers(&source), b"{}").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));

    source.active = false;
    adapter.register(source.clone()).unwrap();
    let err = adapter.accept(&headers(&source), b"{}").await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn source_without_secret_accepts_and_keeps_raw_bodies() {
    let (engine, adapter) = adapter();
    let source = github_source(None);
    adapter.register(source.clone()).unwrap();

    let response = adapter
        .accept(&headers(&source), b"plain text ping")
        .await
        .unwrap();
    let log = engine.store().get_event(&response.id).await.unwrap();
    assert_eq!(log.event.payload["body"], "plain text ping");
}

#[test]
fn header_names_are_case_insensitive() {
    let source = github_source(Some("s3cr3t"));
    let upper: HashMap<String, String> = headers(&source)
        .into_iter()
        .map(|(name, value)| (name.to_ascii_uppercase(), value))
        .collect();

    let parsed = SourceRequestHeaders::parse(&upper).unwrap();
    assert_eq!(parsed.key, "github.push");
    assert_eq!(parsed.method, "POST");
    assert!(parsed.secret.is_some());
}

#[test]
fn missing_key_header_is_a_validation_error() {
    let source = github_source(None);
    let mut raw = headers(&source);
    raw.remove(HEADER_KEY);
    let err = SourceRequestHeaders::parse(&raw).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
