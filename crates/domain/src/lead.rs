//! Lead aggregate and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::{ContactId, CustomerId, LeadId, OpportunityId, TenantId, UserId, Version};

use crate::error::DomainError;
use crate::event::DomainEvent;

/// The status of a lead in its qualification lifecycle.
///
/// Status transitions:
/// ```text
/// New ──► Contacted ──► Qualified ──► Converted
///             │             │
///             ▼             ▼
///        Unqualified    Nurturing ──► Qualified
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    /// Freshly captured, nobody has reached out yet.
    #[default]
    New,

    /// First contact has been made.
    Contacted,

    /// Vetted and ready for conversion.
    Qualified,

    /// Ruled out (terminal unless re-engaged).
    Unqualified,

    /// Parked for later follow-up.
    Nurturing,

    /// Converted into an opportunity (terminal).
    Converted,
}

impl LeadStatus {
    /// Returns true if a lead in this status may be converted.
    ///
    /// Only qualified leads convert; everything else is rejected at
    /// initiation before any saga state is created.
    pub fn can_convert(&self) -> bool {
        matches!(self, LeadStatus::Qualified)
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Converted)
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Qualified => "qualified",
            LeadStatus::Unqualified => "unqualified",
            LeadStatus::Nurturing => "nurturing",
            LeadStatus::Converted => "converted",
        }
    }

    /// Parses a status from its database representation.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "new" => Ok(LeadStatus::New),
            "contacted" => Ok(LeadStatus::Contacted),
            "qualified" => Ok(LeadStatus::Qualified),
            "unqualified" => Ok(LeadStatus::Unqualified),
            "nurturing" => Ok(LeadStatus::Nurturing),
            "converted" => Ok(LeadStatus::Converted),
            other => Err(DomainError::Validation(format!(
                "unknown lead status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Record of a completed conversion, kept on the lead itself so the
/// origin of an opportunity is always traceable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionInfo {
    pub opportunity_id: OpportunityId,
    pub customer_id: Option<CustomerId>,
    pub contact_id: Option<ContactId>,
    pub converted_by: UserId,
    pub converted_at: DateTime<Utc>,
}

/// A sales lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub tenant_id: TenantId,
    pub company_name: String,
    pub contact_name: String,
    pub contact_email: String,
    pub contact_phone: Option<String>,
    pub website: Option<String>,
    pub status: LeadStatus,
    pub owner_id: Option<UserId>,
    pub conversion: Option<ConversionInfo>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Creates a new lead in status `New`.
    pub fn new(
        tenant_id: TenantId,
        company_name: impl Into<String>,
        contact_name: impl Into<String>,
        contact_email: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: LeadId::new(),
            tenant_id,
            company_name: company_name.into(),
            contact_name: contact_name.into(),
            contact_email: contact_email.into(),
            contact_phone: None,
            website: None,
            status: LeadStatus::New,
            owner_id: None,
            conversion: None,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the lead as qualified.
    pub fn qualify(&mut self) -> Result<(), DomainError> {
        if self.status == LeadStatus::Converted {
            return Err(DomainError::LeadAlreadyConverted);
        }
        self.status = LeadStatus::Qualified;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Converts the lead, recording the opportunity it produced.
    ///
    /// Returns the `lead.converted` event for the outbox. The caller
    /// persists the lead and the event in the same unit of work.
    pub fn convert(
        &mut self,
        opportunity_id: OpportunityId,
        customer_id: Option<CustomerId>,
        contact_id: Option<ContactId>,
        converted_by: UserId,
    ) -> Result<DomainEvent, DomainError> {
        if self.conversion.is_some() {
            return Err(DomainError::LeadAlreadyConverted);
        }
        if !self.status.can_convert() {
            return Err(DomainError::LeadNotConvertible(self.status));
        }
        let now = Utc::now();
        self.status = LeadStatus::Converted;
        self.conversion = Some(ConversionInfo {
            opportunity_id,
            customer_id,
            contact_id,
            converted_by,
            converted_at: now,
        });
        self.updated_at = now;
        Ok(DomainEvent::LeadConverted {
            lead_id: self.id,
            opportunity_id,
            customer_id,
            contact_id,
            converted_by,
        })
    }

    /// Undoes a conversion, returning the lead to `Qualified`.
    ///
    /// Used during saga compensation when a later step failed after
    /// the lead was already marked converted.
    pub fn revert_conversion(&mut self) -> Result<DomainEvent, DomainError> {
        let info = self.conversion.take().ok_or(DomainError::LeadNotConverted)?;
        self.status = LeadStatus::Qualified;
        self.updated_at = Utc::now();
        Ok(DomainEvent::LeadConversionReverted {
            lead_id: self.id,
            opportunity_id: info.opportunity_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qualified_lead() -> Lead {
        let mut lead = Lead::new(TenantId::new(), "Acme Corp", "Jane Doe", "jane@acme.test");
        lead.qualify().unwrap();
        lead
    }

    #[test]
    fn only_qualified_leads_convert() {
        assert!(!LeadStatus::New.can_convert());
        assert!(!LeadStatus::Contacted.can_convert());
        assert!(LeadStatus::Qualified.can_convert());
        assert!(!LeadStatus::Unqualified.can_convert());
        assert!(!LeadStatus::Nurturing.can_convert());
        assert!(!LeadStatus::Converted.can_convert());
    }

    #[test]
    fn convert_records_conversion_info() {
        let mut lead = qualified_lead();
        let opp = OpportunityId::new();
        let by = UserId::new();

        let event = lead.convert(opp, None, None, by).unwrap();

        assert_eq!(lead.status, LeadStatus::Converted);
        let info = lead.conversion.as_ref().unwrap();
        assert_eq!(info.opportunity_id, opp);
        assert_eq!(info.converted_by, by);
        assert!(matches!(event, DomainEvent::LeadConverted { lead_id, .. } if lead_id == lead.id));
    }

    #[test]
    fn convert_rejects_unqualified_lead() {
        let mut lead = Lead::new(TenantId::new(), "Acme Corp", "Jane Doe", "jane@acme.test");
        let err = lead
            .convert(OpportunityId::new(), None, None, UserId::new())
            .unwrap_err();
        assert!(matches!(err, DomainError::LeadNotConvertible(LeadStatus::New)));
    }

    #[test]
    fn convert_is_rejected_twice() {
        let mut lead = qualified_lead();
        lead.convert(OpportunityId::new(), None, None, UserId::new())
            .unwrap();
        let err = lead
            .convert(OpportunityId::new(), None, None, UserId::new())
            .unwrap_err();
        assert!(matches!(err, DomainError::LeadAlreadyConverted));
    }

    #[test]
    fn revert_restores_qualified_status() {
        let mut lead = qualified_lead();
        let opp = OpportunityId::new();
        lead.convert(opp, None, None, UserId::new()).unwrap();

        let event = lead.revert_conversion().unwrap();

        assert_eq!(lead.status, LeadStatus::Qualified);
        assert!(lead.conversion.is_none());
        assert!(matches!(
            event,
            DomainEvent::LeadConversionReverted { opportunity_id, .. } if opportunity_id == opp
        ));
    }

    #[test]
    fn revert_requires_prior_conversion() {
        let mut lead = qualified_lead();
        assert!(matches!(
            lead.revert_conversion().unwrap_err(),
            DomainError::LeadNotConverted
        ));
    }

    #[test]
    fn status_parse_roundtrip() {
        for status in [
            LeadStatus::New,
            LeadStatus::Contacted,
            LeadStatus::Qualified,
            LeadStatus::Unqualified,
            LeadStatus::Nurturing,
            LeadStatus::Converted,
        ] {
            assert_eq!(LeadStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(LeadStatus::parse("bogus").is_err());
    }
}
