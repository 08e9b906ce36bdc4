//! # jobrun-rs
//!
//! Event-triggered job execution with idempotent task replay.
//!
//! Events are routed to versioned jobs. Each execution records its side
//! effects as tasks keyed by an idempotency key, so an interrupted execution
//! is resumed by replaying job code against the tasks it already completed.
//! Storage is Postgres (sqlx) or in-memory; observability is tracing plus
//! OpenTelemetry.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http_source;
pub mod ledger;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod telemetry;
pub mod wire;
pub mod worker;
