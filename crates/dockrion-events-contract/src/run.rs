//! Run records and run-id handling.

use crate::event::now_unix_millis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Lifecycle status of a run.
///
/// Transitions are linear: `PENDING -> RUNNING -> {COMPLETED, FAILED,
/// CANCELLED}`. Once terminal, no further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Failure detail attached to a FAILED run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RunError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Record of a single managed run. Owned and mutated exclusively by the
/// run manager; everybody else reads snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    /// Unix milliseconds.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Event retention window after the terminal event.
    pub ttl_seconds: u64,
}

impl Run {
    pub fn new(run_id: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Pending,
            created_at: now_unix_millis(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            ttl_seconds,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Rejection reasons for client-provided run ids.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunIdError {
    #[error("run id cannot be empty")]
    Empty,
    #[error("run id must be 128 characters or less")]
    TooLong,
    #[error("run id cannot start with underscore (reserved)")]
    ReservedPrefix,
    #[error("run id must contain only alphanumeric characters, hyphens, and underscores, and must start with an alphanumeric character")]
    InvalidCharacters,
}

/// Validate a client-provided run id.
///
/// 1-128 characters, alphanumeric plus `-`/`_`, alphanumeric first
/// character. Leading underscores are reserved for internal use.
pub fn validate_run_id(run_id: &str) -> Result<(), RunIdError> {
    let mut chars = run_id.chars();
    let Some(first) = chars.next() else {
        return Err(RunIdError::Empty);
    };
    if run_id.len() > 128 {
        return Err(RunIdError::TooLong);
    }
    if first == '_' {
        return Err(RunIdError::ReservedPrefix);
    }
    if !first.is_ascii_alphanumeric() {
        return Err(RunIdError::InvalidCharacters);
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(RunIdError::InvalidCharacters);
    }
    Ok(())
}

/// Generate a fresh run id.
pub fn generate_run_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}
