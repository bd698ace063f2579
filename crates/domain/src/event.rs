//! Domain events published through the transactional outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{ContactId, CustomerId, EventId, LeadId, OpportunityId, PipelineId, SagaId, StageId,
    TenantId, UserId};

/// Everything the sales backend announces to the outside world.
///
/// One closed union instead of per-event structs: the compiler checks
/// that routing metadata below covers every variant, and consumers can
/// match exhaustively on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    LeadConverted {
        lead_id: LeadId,
        opportunity_id: OpportunityId,
        customer_id: Option<CustomerId>,
        contact_id: Option<ContactId>,
        converted_by: UserId,
    },
    LeadConversionReverted {
        lead_id: LeadId,
        opportunity_id: OpportunityId,
    },
    OpportunityCreated {
        opportunity_id: OpportunityId,
        code: String,
        lead_id: Option<LeadId>,
        customer_id: CustomerId,
        pipeline_id: PipelineId,
        stage_id: StageId,
    },
    OpportunityDeleted {
        opportunity_id: OpportunityId,
    },
    ConversionCompleted {
        saga_id: SagaId,
        lead_id: LeadId,
        opportunity_id: OpportunityId,
    },
    ConversionCompensated {
        saga_id: SagaId,
        lead_id: LeadId,
        reason: String,
    },
    ConversionFailed {
        saga_id: SagaId,
        lead_id: LeadId,
        error: String,
    },
}

impl DomainEvent {
    /// Returns the dotted event type used as the broker routing suffix.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::LeadConverted { .. } => "lead.converted",
            DomainEvent::LeadConversionReverted { .. } => "lead.conversion_reverted",
            DomainEvent::OpportunityCreated { .. } => "opportunity.created",
            DomainEvent::OpportunityDeleted { .. } => "opportunity.deleted",
            DomainEvent::ConversionCompleted { .. } => "conversion.completed",
            DomainEvent::ConversionCompensated { .. } => "conversion.compensated",
            DomainEvent::ConversionFailed { .. } => "conversion.failed",
        }
    }

    /// Returns the type of the aggregate the event belongs to.
    pub fn aggregate_type(&self) -> &'static str {
        match self {
            DomainEvent::LeadConverted { .. } | DomainEvent::LeadConversionReverted { .. } => {
                "lead"
            }
            DomainEvent::OpportunityCreated { .. } | DomainEvent::OpportunityDeleted { .. } => {
                "opportunity"
            }
            DomainEvent::ConversionCompleted { .. }
            | DomainEvent::ConversionCompensated { .. }
            | DomainEvent::ConversionFailed { .. } => "conversion_saga",
        }
    }

    /// Returns the ID of the aggregate the event belongs to.
    pub fn aggregate_id(&self) -> Uuid {
        match self {
            DomainEvent::LeadConverted { lead_id, .. }
            | DomainEvent::LeadConversionReverted { lead_id, .. } => lead_id.as_uuid(),
            DomainEvent::OpportunityCreated { opportunity_id, .. }
            | DomainEvent::OpportunityDeleted { opportunity_id } => opportunity_id.as_uuid(),
            DomainEvent::ConversionCompleted { saga_id, .. }
            | DomainEvent::ConversionCompensated { saga_id, .. }
            | DomainEvent::ConversionFailed { saga_id, .. } => saga_id.as_uuid(),
        }
    }
}

/// An event envelope ready for the outbox: the serialized payload plus
/// the metadata consumers route and deduplicate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    /// Version of the aggregate after the change that produced this event.
    pub version: i64,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Wraps a domain event for the outbox.
    pub fn new(
        tenant_id: TenantId,
        version: i64,
        event: &DomainEvent,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: EventId::new(),
            tenant_id,
            event_type: event.event_type().to_string(),
            aggregate_id: event.aggregate_id(),
            aggregate_type: event.aggregate_type().to_string(),
            version,
            occurred_at: Utc::now(),
            payload: serde_json::to_value(event)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_payload_is_tagged_by_kind() {
        let event = DomainEvent::OpportunityDeleted {
            opportunity_id: OpportunityId::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "opportunity_deleted");

        let back: DomainEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn record_carries_routing_metadata() {
        let lead_id = LeadId::new();
        let event = DomainEvent::LeadConverted {
            lead_id,
            opportunity_id: OpportunityId::new(),
            customer_id: None,
            contact_id: None,
            converted_by: UserId::new(),
        };
        let record = EventRecord::new(TenantId::new(), 2, &event).unwrap();

        assert_eq!(record.event_type, "lead.converted");
        assert_eq!(record.aggregate_type, "lead");
        assert_eq!(record.aggregate_id, lead_id.as_uuid());
        assert_eq!(record.version, 2);
    }
}
