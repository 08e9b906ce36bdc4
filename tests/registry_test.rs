//! Job definitions loaded from TOML.

use jobrun_rs::error::Error;
use jobrun_rs::model::{EventId, JobRef, RawEvent};
use jobrun_rs::registry::JobRegistry;
use serde_json::json;
use std::fs;

const WELCOME: &str = r#"
[job]
id = "welcome-email"
name = "Welcome email"
version = "1"

[job.trigger]
event = "user.created"
filter = { plan = ["pro", "team"] }

[[job.connections]]
key = "resend"
usesLocalAuth = true
"#;

const WELCOME_V2: &str = r#"
[job]
id = "welcome-email"
name = "Welcome email"
version = "2"
supportsPreparation = true

[job.trigger]
event = "user.created"
source = "app"
"#;

fn event(source: &str, payload: serde_json::Value) -> RawEvent {
    RawEvent {
        id: EventId::from("e1"),
        name: "user.created".into(),
        source: source.into(),
        payload,
        context: None,
        timestamp: chrono::Utc::now(),
    }
}

#[test]
fn loads_every_toml_file_in_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("welcome.toml"), WELCOME).unwrap();
    fs::write(dir.path().join("welcome_v2.toml"), WELCOME_V2).unwrap();
    fs::write(dir.path().join("README.md"), "not a job").unwrap();

    let registry = JobRegistry::load_from_dir(dir.path()).unwrap();
    let jobs = registry.jobs().unwrap();
    assert_eq!(jobs.len(), 2);

    let v1 = registry
        .get(&JobRef {
            id: "welcome-email".into(),
            version: "1".into(),
        })
        .unwrap()
        .unwrap();
    assert_eq!(v1.connections[0].key, "resend");
    assert!(v1.connections[0].uses_local_auth);
    assert!(!v1.supports_preparation);

    let matching = registry
        .matching(&event("app", json!({"plan": "pro"})))
        .unwrap();
    assert_eq!(matching.len(), 2);
    let matching = registry
        .matching(&event("crm", json!({"plan": "free"})))
        .unwrap();
    assert!(matching.is_empty());
}

#[test]
fn malformed_definition_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("broken.toml"), "[job]\nid = \"x\"\n").unwrap();

    let err = JobRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, Error::Config(ref msg) if msg.contains("broken.toml")));
}

#[test]
fn invalid_filter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bad = WELCOME.replace(r#"filter = { plan = ["pro", "team"] }"#, r#"filter = { plan = "pro" }"#);
    fs::write(dir.path().join("bad.toml"), bad).unwrap();

    let err = JobRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn versions_are_immutable() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("welcome.toml"), WELCOME).unwrap();
    let registry = JobRegistry::load_from_dir(dir.path()).unwrap();

    let v1 = registry.jobs().unwrap().remove(0);
    registry.register(v1.clone()).unwrap();

    let mut changed = v1;
    changed.name = "Different".into();
    let err = registry.register(changed).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn deprecated_versions_stop_matching() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("welcome.toml"), WELCOME).unwrap();
    fs::write(dir.path().join("welcome_v2.toml"), WELCOME_V2).unwrap();
    let registry = JobRegistry::load_from_dir(dir.path()).unwrap();

    let v1 = JobRef {
        id: "welcome-email".into(),
        version: "1".into(),
    };
    registry.deprecate(&v1).unwrap();
    assert!(registry.is_deprecated(&v1).unwrap());

    let matching = registry
        .matching(&event("app", json!({"plan": "pro"})))
        .unwrap();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].version, "2");

    let unknown = JobRef {
        id: "nope".into(),
        version: "1".into(),
    };
    assert!(matches!(registry.deprecate(&unknown), Err(Error::NotFound(_))));
}

#[test]
fn missing_directory_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = JobRegistry::load_from_dir(&dir.path().join("absent")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
