//! Identifier newtypes and the injected identifier generator.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Event identifier. Caller-supplied or generated; immutable once accepted.
    EventId
);
string_id!(
    /// Execution identifier.
    ExecutionId
);
string_id!(
    /// Task identifier (distinct from the caller's idempotency key).
    TaskId
);

/// Source of fresh identifiers.
///
/// Passed explicitly into the router and coordinator so that tests can use
/// deterministic ids and production can use time-sortable ones.
pub trait IdGenerator: Send + Sync {
    fn next(&self) -> String;
}

/// UUIDv7 identifiers: globally unique and sortable by creation time.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidV7Generator;

impl IdGenerator for UuidV7Generator {
    fn next(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Deterministic `<prefix><n>` identifiers for tests and local tooling.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{n}", self.prefix)
    }
}
