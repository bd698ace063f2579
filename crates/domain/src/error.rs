//! Error types shared across the domain layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lead::LeadStatus;
use crate::saga::SagaState;

/// Classifies a failure so callers can decide whether to retry,
/// compensate, or surface the error to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request itself is invalid. Never retried.
    Validation,
    /// A concurrent writer got there first. The caller re-reads and retries.
    Conflict,
    /// A referenced record does not exist.
    NotFound,
    /// A temporary infrastructure failure. Retried up to the step cap.
    Transient,
    /// An unrecoverable failure. Triggers compensation immediately.
    Fatal,
}

impl ErrorKind {
    /// Returns true if a failure of this kind may be retried in place.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Returns the stable string code stored in saga diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A failure raised by a saga step or one of its collaborators.
///
/// Carries the [`ErrorKind`] that drives the orchestrator's retry and
/// compensation decisions.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Returns true if this failure may be retried in place.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors raised by aggregate invariants.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    #[error("lead cannot be converted from status {0}")]
    LeadNotConvertible(LeadStatus),

    #[error("lead has already been converted")]
    LeadAlreadyConverted,

    #[error("lead is not converted")]
    LeadNotConverted,

    #[error("pipeline has no stages")]
    PipelineWithoutStages,

    #[error("invalid saga transition from {from} to {to}")]
    InvalidSagaTransition { from: SagaState, to: SagaState },

    #[error("saga has no step at index {0}")]
    NoSuchStep(usize),

    #[error("{0}")]
    Validation(String),
}
