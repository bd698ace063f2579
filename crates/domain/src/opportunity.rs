//! Opportunity aggregate.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use common::{CustomerId, LeadId, OpportunityId, PipelineId, StageId, TenantId, UserId, Version};

use crate::error::DomainError;
use crate::lead::Lead;
use crate::pipeline::Pipeline;
use crate::value_objects::Money;

/// A sales opportunity, usually created by converting a qualified lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub tenant_id: TenantId,
    /// Human-readable reference, e.g. `OPP-1A2B3C4D`.
    pub code: String,
    pub name: String,
    /// Set when the opportunity originated from a lead conversion.
    pub lead_id: Option<LeadId>,
    pub customer_id: CustomerId,
    pub customer_name: String,
    pub pipeline_id: PipelineId,
    pub stage_id: StageId,
    pub amount: Money,
    /// Win probability in percent, seeded from the entry stage.
    pub probability: i32,
    pub description: Option<String>,
    pub expected_close_date: Option<NaiveDate>,
    pub owner_id: Option<UserId>,
    pub created_by: UserId,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Opportunity {
    /// Creates an opportunity from a converting lead.
    ///
    /// The opportunity enters the pipeline at its entry stage and
    /// inherits that stage's win probability. Fails if the pipeline
    /// has no open stage to enter at.
    pub fn from_lead(
        lead: &Lead,
        pipeline: &Pipeline,
        customer_id: CustomerId,
        customer_name: impl Into<String>,
        created_by: UserId,
    ) -> Result<Self, DomainError> {
        let stage = pipeline
            .entry_stage()
            .ok_or(DomainError::PipelineWithoutStages)?;
        let id = OpportunityId::new();
        let now = Utc::now();
        Ok(Self {
            id,
            tenant_id: lead.tenant_id,
            code: generate_code(id),
            name: format!("{} - Opportunity", lead.company_name),
            lead_id: Some(lead.id),
            customer_id,
            customer_name: customer_name.into(),
            pipeline_id: pipeline.id,
            stage_id: stage.id,
            amount: Money::zero(),
            probability: stage.probability,
            description: None,
            expected_close_date: None,
            owner_id: lead.owner_id,
            created_by,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        })
    }
}

fn generate_code(id: OpportunityId) -> String {
    let hex = id.as_uuid().simple().to_string();
    format!("OPP-{}", hex[..8].to_uppercase())
}
