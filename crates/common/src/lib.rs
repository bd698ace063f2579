//! Shared types used across the sales backend crates.
//!
//! Every aggregate and cross-aggregate reference uses a dedicated
//! newtype identifier so that a lead ID can never be passed where an
//! opportunity ID is expected.

mod types;

pub use types::{
    ContactId, CustomerId, EventId, LeadId, OpportunityId, PipelineId, SagaId, StageId, TenantId,
    UserId, Version,
};
