use thiserror::Error;

use common::{LeadId, PipelineId, SagaId};
use domain::{DomainError, LeadStatus, StepType};
use store::StoreError;

/// Errors surfaced by the conversion orchestrator.
///
/// Step-level failures never reach this type directly: they are
/// absorbed into retries or compensation and end up as saga
/// diagnostics. What remains here is what the caller (or the resume
/// sweeper) has to deal with.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("lead {0} not found")]
    LeadNotFound(LeadId),

    #[error("pipeline {0} not found")]
    PipelineNotFound(PipelineId),

    #[error("conversion saga {0} not found")]
    SagaNotFound(SagaId),

    #[error("lead {lead_id} cannot be converted from status {status}")]
    LeadNotConvertible {
        lead_id: LeadId,
        status: LeadStatus,
    },

    #[error("no handler registered for step {0}")]
    NoHandler(StepType),

    #[error("saga {0} completed without a recorded opportunity code")]
    MissingOpportunityCode(SagaId),

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, ConversionError>;
