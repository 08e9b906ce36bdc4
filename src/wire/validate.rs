//! Boundary validation.
//!
//! Rejects malformed input with [`Error::Validation`] before anything reaches
//! the router or coordinator. The core state machine assumes its inputs have
//! been through here.

use serde::de::DeserializeOwned;

use super::{
    CompleteTaskBodyInput, ExecuteJobResponse, RawEventInput, RunTaskBodyInput,
    RunTaskBodyOutput, SendEventBody, SendEventOptions,
};
use crate::error::{Error, Result};
use crate::model::TaskStatus;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 512;
pub const MAX_NAME_LEN: usize = 256;

/// Parse a JSON body, mapping decode failures to validation errors.
pub fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("malformed body: {e}")))
}

fn require_text(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    if value.len() > max_len {
        return Err(Error::Validation(format!(
            "{field} exceeds {max_len} bytes ({} given)",
            value.len()
        )));
    }
    Ok(())
}

pub fn validate_raw_event(event: &RawEventInput) -> Result<()> {
    require_text("event.name", &event.name, MAX_NAME_LEN)?;
    if let Some(ref id) = event.id {
        require_text("event.id", id.as_str(), MAX_IDEMPOTENCY_KEY_LEN)?;
    }
    if let Some(ref source) = event.source {
        require_text("event.source", source, MAX_NAME_LEN)?;
    }
    Ok(())
}

pub fn validate_send_options(options: &SendEventOptions) -> Result<()> {
    if options.deliver_at.is_some() && options.deliver_after.is_some() {
        return Err(Error::Validation(
            "options.deliverAt and options.deliverAfter are mutually exclusive".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_send_event(body: &SendEventBody) -> Result<()> {
    validate_raw_event(&body.event)?;
    validate_send_options(&body.options)
}

/// Validate and normalize a task request.
pub fn validate_run_task(input: RunTaskBodyInput) -> Result<RunTaskBodyOutput> {
    require_text(
        "idempotencyKey",
        &input.idempotency_key,
        MAX_IDEMPOTENCY_KEY_LEN,
    )?;
    require_text("name", &input.name, MAX_NAME_LEN)?;
    if input.noop && input.delay_until.is_some() {
        return Err(Error::Validation(
            "a noop task cannot carry delayUntil".to_string(),
        ));
    }
    Ok(input.into())
}

pub fn validate_complete_task(body: &CompleteTaskBodyInput) -> Result<()> {
    if let Some(ref description) = body.description {
        require_text("description", description, 4096)?;
    }
    Ok(())
}

/// A completed response carries no task; an interrupted one carries exactly
/// the task it stopped on, which is either waiting or errored.
pub fn validate_execute_response(response: &ExecuteJobResponse) -> Result<()> {
    match (response.completed, response.task.as_ref()) {
        (true, Some(_)) => Err(Error::Validation(
            "completed response must not carry a task".to_string(),
        )),
        (false, None) => Err(Error::Validation(
            "interrupted response must carry the task it stopped on".to_string(),
        )),
        (false, Some(task)) if task.execution_id != response.execution_id => {
            Err(Error::Validation(format!(
                "task {} belongs to execution {}, not {}",
                task.id, task.execution_id, response.execution_id
            )))
        }
        (false, Some(task))
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Errored) =>
        {
            Err(Error::Validation(format!(
                "interrupted on task {} with status {}",
                task.id, task.status
            )))
        }
        _ => Ok(()),
    }
}
