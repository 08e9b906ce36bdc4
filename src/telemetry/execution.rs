//! Span helpers for executions and tasks.

use opentelemetry::KeyValue;
use tracing::Span;

use crate::model::{ExecutionId, ExecutionState, JobRef};

/// Start a span covering one dispatch of an execution.
///
/// `execution.state` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_execution_span(execution_id: &ExecutionId, job: &JobRef) -> Span {
    tracing::info_span!(
        "execution.dispatch",
        "execution.id" = %execution_id,
        "job.id" = %job.id,
        "job.version" = %job.version,
        "execution.state" = tracing::field::Empty,
    )
}

pub fn start_task_span(execution_id: &ExecutionId, idempotency_key: &str, name: &str) -> Span {
    tracing::info_span!(
        "task.run",
        "execution.id" = %execution_id,
        "task.key" = idempotency_key,
        "task.name" = name,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition on the span and count it.
pub fn record_state_transition(span: &Span, from: ExecutionState, to: ExecutionState) {
    span.record("execution.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
    super::metrics::execution_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.to_string()),
            KeyValue::new("to", to.to_string()),
        ],
    );
}
