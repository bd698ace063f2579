//! Domain model for the multi-tenant sales backend.
//!
//! This crate contains the aggregates touched by lead conversion:
//! - Lead with its status machine and conversion record
//! - Opportunity created from a converted lead
//! - Pipeline and its ordered stages
//! - ConversionSaga, the orchestration record that tracks a conversion
//!   across aggregates, step by step, with compensation bookkeeping
//! - Domain events published through the transactional outbox

pub mod error;
pub mod event;
pub mod idempotency;
pub mod lead;
pub mod opportunity;
pub mod pipeline;
pub mod saga;
pub mod value_objects;

pub use error::{DomainError, ErrorKind, StepError};
pub use event::{DomainEvent, EventRecord};
pub use idempotency::{IdempotencyKey, conversion_key};
pub use lead::{ConversionInfo, Lead, LeadStatus};
pub use opportunity::Opportunity;
pub use pipeline::{Pipeline, Stage};
pub use saga::{
    ConversionRequest, ConversionResult, ConversionSaga, DEFAULT_STEP_RETRIES, SagaState, SagaStep,
    StepStatus, StepType,
};
pub use value_objects::Money;
