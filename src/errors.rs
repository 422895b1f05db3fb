//! Typed error hierarchy for shipwright.
//!
//! One enum per subsystem:
//! - `GuardError`: command and path validation failures (thrown before any spawn)
//! - `SandboxError`: sandbox entry-point failures
//! - `SchemaError`: schema lookup and structural validation failures
//! - `WorkflowError`: state machine failures
//!
//! `ErrorKind` collapses all of them onto the reporting taxonomy used by the
//! CLI and by workflow failure records.

use std::fmt;

use thiserror::Error;

use crate::workflow::WorkflowState;

/// Reporting taxonomy shared by every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    ValidationFailed,
    CommandBlocked,
    PathViolation,
    InvalidTransition,
    RetryLimitExceeded,
    StageExecutionFailed,
    SandboxTimeout,
    SchemaNotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors raised by `CommandGuard` before anything is executed.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("Command blocked: {reason}")]
    CommandBlocked { reason: String },

    #[error("Path violation for '{path}': {reason}")]
    PathViolation { path: String, reason: String },
}

impl GuardError {
    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::CommandBlocked {
            reason: reason.into(),
        }
    }

    pub fn path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PathViolation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CommandBlocked { .. } => ErrorKind::CommandBlocked,
            Self::PathViolation { .. } => ErrorKind::PathViolation,
        }
    }
}

/// Errors from the sandbox entry points. Execution failures are not errors;
/// they are reported through `ProcessResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("Command blocked: rate limit exceeded for {key}")]
    RateLimited { key: String },

    #[error("Sandbox execution timed out after {seconds}s")]
    SandboxTimeout { seconds: u64 },

    #[error("Command exited with non-zero code {code}")]
    NonZeroExit { code: i32 },
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Guard(e) => e.kind(),
            Self::RateLimited { .. } => ErrorKind::CommandBlocked,
            Self::SandboxTimeout { .. } => ErrorKind::SandboxTimeout,
            Self::NonZeroExit { .. } => ErrorKind::StageExecutionFailed,
        }
    }
}

/// Errors from the schema validator.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Schema '{name}' not found")]
    SchemaNotFound { name: String },

    #[error("Schema '{name}' is invalid: {message}")]
    InvalidSchema { name: String, message: String },

    #[error("Validation against '{schema}' failed: {}", errors.join("; "))]
    ValidationFailed { schema: String, errors: Vec<String> },
}

impl SchemaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaNotFound { .. } => ErrorKind::SchemaNotFound,
            Self::InvalidSchema { .. } | Self::ValidationFailed { .. } => {
                ErrorKind::ValidationFailed
            }
        }
    }
}

/// Errors from the workflow state machine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow {id} not found")]
    NotFound { id: String },

    #[error("Workflow {id} already exists for this ticket (state {state})")]
    AlreadyExists { id: String, state: WorkflowState },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    #[error("Workflow in state {state} is not retryable")]
    NotRetryable { state: WorkflowState },

    #[error("Retry limit exceeded ({retries}/{max})")]
    RetryLimitExceeded { retries: u32, max: u32 },

    #[error("Workflow already finished in state {state}")]
    AlreadyTerminal { state: WorkflowState },

    #[error("Workflow {id} was modified concurrently")]
    ConcurrentModification { id: String },

    #[error("Stage {stage} failed: {message}")]
    StageExecutionFailed { stage: String, message: String },

    #[error("Workflow store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RetryLimitExceeded { .. } => ErrorKind::RetryLimitExceeded,
            Self::StageExecutionFailed { .. } | Self::Store(_) => ErrorKind::StageExecutionFailed,
            Self::NotFound { .. } => ErrorKind::ValidationFailed,
            Self::AlreadyExists { .. }
            | Self::InvalidTransition { .. }
            | Self::NotRetryable { .. }
            | Self::AlreadyTerminal { .. }
            | Self::ConcurrentModification { .. } => ErrorKind::InvalidTransition,
        }
    }
}
