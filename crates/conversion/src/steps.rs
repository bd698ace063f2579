//! Apply/compensate handler pairs for the conversion steps.
//!
//! Each handler works inside the unit of work the orchestrator passes
//! it, so a step's writes commit or vanish together with the saga
//! bookkeeping. Directory calls go out under a timeout; a timeout is a
//! transient failure and lands in the step's retry budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use domain::{
    ConversionSaga, DomainError, DomainEvent, EventRecord, Opportunity, SagaStep, StepError,
    StepType,
};
use store::Uow;

use crate::services::{ContactDirectory, CustomerDirectory, NewContact, NewCustomer};

/// One step's forward and backward actions.
///
/// `apply` records the input snapshot it acted on directly on `step`
/// and returns the output recorded on completion; `compensate` undoes
/// a completed apply and must tolerate running more than once.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn apply(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
        step: &mut SagaStep,
    ) -> Result<serde_json::Value, StepError>;

    async fn compensate(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
    ) -> Result<(), StepError>;
}

/// Typed dispatch table from step type to handler.
pub struct StepRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The full production step set.
    pub fn standard(
        customers: Arc<dyn CustomerDirectory>,
        contacts: Arc<dyn ContactDirectory>,
        call_timeout: Duration,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(
            StepType::CreateCustomer,
            Arc::new(CreateCustomerStep {
                directory: Arc::clone(&customers),
                timeout: call_timeout,
            }),
        );
        registry.register(
            StepType::LookupCustomer,
            Arc::new(LookupCustomerStep {
                directory: customers,
                timeout: call_timeout,
            }),
        );
        registry.register(
            StepType::CreateContact,
            Arc::new(CreateContactStep {
                directory: contacts,
                timeout: call_timeout,
            }),
        );
        registry.register(StepType::CreateOpportunity, Arc::new(CreateOpportunityStep));
        registry.register(StepType::MarkLeadConverted, Arc::new(MarkLeadConvertedStep));
        registry
    }

    pub fn register(&mut self, step_type: StepType, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(step_type, handler);
    }

    pub fn handler(&self, step_type: StepType) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&step_type).cloned()
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounds a directory call; an elapsed timeout is transient.
async fn bounded<T, F>(limit: Duration, call: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, StepError>> + Send,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StepError::transient("directory call timed out"))?
}

fn step_error(err: DomainError) -> StepError {
    match err {
        DomainError::LeadAlreadyConverted => StepError::conflict(err.to_string()),
        DomainError::LeadNotConvertible(_) | DomainError::PipelineWithoutStages => {
            StepError::validation(err.to_string())
        }
        other => StepError::fatal(other.to_string()),
    }
}

fn record(saga: &ConversionSaga, version: i64, event: &DomainEvent) -> Result<EventRecord, StepError> {
    EventRecord::new(saga.tenant_id, version, event).map_err(|e| StepError::fatal(e.to_string()))
}

/// Creates a customer record for the converting lead.
///
/// Not compensatable: a customer created for a conversion that later
/// rolled back is left in the directory for an operator to keep or
/// merge.
struct CreateCustomerStep {
    directory: Arc<dyn CustomerDirectory>,
    timeout: Duration,
}

#[async_trait]
impl StepHandler for CreateCustomerStep {
    async fn apply(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
        step: &mut SagaStep,
    ) -> Result<serde_json::Value, StepError> {
        let lead = uow
            .lead(saga.tenant_id, saga.lead_id)
            .await?
            .ok_or_else(|| StepError::not_found(format!("lead {} not found", saga.lead_id)))?;
        step.input = serde_json::json!({
            "lead_id": saga.lead_id,
            "company_name": lead.company_name,
            "contact_email": lead.contact_email,
        });

        let new = NewCustomer {
            tenant_id: saga.tenant_id,
            name: lead.company_name.clone(),
            email: Some(lead.contact_email.clone()),
            // The saga ID dedupes the call: a retry lands on the
            // record the first attempt created.
            external_ref: saga.id.to_string(),
        };
        let customer = bounded(self.timeout, self.directory.create_if_absent(new)).await?;

        saga.set_customer(customer.id, true);
        Ok(serde_json::json!({
            "customer_id": customer.id,
            "name": customer.name,
        }))
    }

    async fn compensate(
        &self,
        _uow: &mut dyn Uow,
        _saga: &mut ConversionSaga,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Verifies the customer the caller asked to attach the opportunity to.
struct LookupCustomerStep {
    directory: Arc<dyn CustomerDirectory>,
    timeout: Duration,
}

#[async_trait]
impl StepHandler for LookupCustomerStep {
    async fn apply(
        &self,
        _uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
        step: &mut SagaStep,
    ) -> Result<serde_json::Value, StepError> {
        let customer_id = saga
            .request
            .customer_id
            .ok_or_else(|| StepError::fatal("lookup step without a customer in the request"))?;
        step.input = serde_json::json!({ "customer_id": customer_id });

        let found = bounded(self.timeout, self.directory.exists(saga.tenant_id, customer_id))
            .await?;
        if !found {
            return Err(StepError::not_found(format!(
                "customer {customer_id} not found"
            )));
        }

        saga.set_customer(customer_id, false);
        Ok(serde_json::json!({ "customer_id": customer_id }))
    }

    async fn compensate(
        &self,
        _uow: &mut dyn Uow,
        _saga: &mut ConversionSaga,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Creates a contact under the resolved customer from the lead's
/// contact details.
struct CreateContactStep {
    directory: Arc<dyn ContactDirectory>,
    timeout: Duration,
}

#[async_trait]
impl StepHandler for CreateContactStep {
    async fn apply(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
        step: &mut SagaStep,
    ) -> Result<serde_json::Value, StepError> {
        let customer_id = saga
            .customer_id
            .ok_or_else(|| StepError::fatal("contact step before a customer was resolved"))?;
        let lead = uow
            .lead(saga.tenant_id, saga.lead_id)
            .await?
            .ok_or_else(|| StepError::not_found(format!("lead {} not found", saga.lead_id)))?;
        step.input = serde_json::json!({
            "customer_id": customer_id,
            "contact_name": lead.contact_name,
            "contact_email": lead.contact_email,
        });

        let new = NewContact {
            tenant_id: saga.tenant_id,
            customer_id,
            name: lead.contact_name.clone(),
            email: lead.contact_email.clone(),
            external_ref: saga.id.to_string(),
        };
        let contact = bounded(self.timeout, self.directory.create_if_absent(new)).await?;

        saga.set_contact(contact.id);
        Ok(serde_json::json!({ "contact_id": contact.id }))
    }

    async fn compensate(
        &self,
        _uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
    ) -> Result<(), StepError> {
        if let Some(contact_id) = saga.contact_id {
            bounded(self.timeout, self.directory.delete(saga.tenant_id, contact_id)).await?;
        }
        Ok(())
    }
}

/// Creates the opportunity in the pipeline's entry stage.
struct CreateOpportunityStep;

#[async_trait]
impl StepHandler for CreateOpportunityStep {
    async fn apply(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
        step: &mut SagaStep,
    ) -> Result<serde_json::Value, StepError> {
        let customer_id = saga
            .customer_id
            .ok_or_else(|| StepError::fatal("opportunity step before a customer was resolved"))?;
        let lead = uow
            .lead(saga.tenant_id, saga.lead_id)
            .await?
            .ok_or_else(|| StepError::not_found(format!("lead {} not found", saga.lead_id)))?;
        let pipeline = uow
            .pipeline(saga.tenant_id, saga.request.pipeline_id)
            .await?
            .ok_or_else(|| {
                StepError::not_found(format!("pipeline {} not found", saga.request.pipeline_id))
            })?;
        step.input = serde_json::json!({
            "lead_id": saga.lead_id,
            "customer_id": customer_id,
            "pipeline_id": saga.request.pipeline_id,
            "amount": saga.request.amount,
            "probability": saga.request.probability,
        });

        let mut opportunity = Opportunity::from_lead(
            &lead,
            &pipeline,
            customer_id,
            lead.company_name.clone(),
            saga.initiated_by,
        )
        .map_err(step_error)?;
        let request = &saga.request;
        if let Some(amount) = request.amount {
            opportunity.amount = amount;
        }
        if let Some(probability) = request.probability {
            opportunity.probability = probability;
        }
        if let Some(owner) = request.owner_id {
            opportunity.owner_id = Some(owner);
        }
        opportunity.description = request.description.clone();
        opportunity.expected_close_date = request.expected_close_date;

        uow.insert_opportunity(&opportunity).await?;
        let event = DomainEvent::OpportunityCreated {
            opportunity_id: opportunity.id,
            code: opportunity.code.clone(),
            lead_id: opportunity.lead_id,
            customer_id,
            pipeline_id: opportunity.pipeline_id,
            stage_id: opportunity.stage_id,
        };
        uow.enqueue_event(record(saga, opportunity.version.as_i64(), &event)?)
            .await?;

        saga.set_opportunity(opportunity.id);
        Ok(serde_json::json!({
            "opportunity_id": opportunity.id,
            "code": opportunity.code,
        }))
    }

    async fn compensate(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
    ) -> Result<(), StepError> {
        let Some(opportunity_id) = saga.opportunity_id else {
            return Ok(());
        };
        uow.delete_opportunity(saga.tenant_id, opportunity_id).await?;
        let event = DomainEvent::OpportunityDeleted { opportunity_id };
        uow.enqueue_event(record(saga, 0, &event)?).await?;
        Ok(())
    }
}

/// Flips the lead to `Converted`, the last step of the saga.
struct MarkLeadConvertedStep;

#[async_trait]
impl StepHandler for MarkLeadConvertedStep {
    async fn apply(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
        step: &mut SagaStep,
    ) -> Result<serde_json::Value, StepError> {
        let opportunity_id = saga
            .opportunity_id
            .ok_or_else(|| StepError::fatal("mark step before the opportunity was created"))?;
        let mut lead = uow
            .lead(saga.tenant_id, saga.lead_id)
            .await?
            .ok_or_else(|| StepError::not_found(format!("lead {} not found", saga.lead_id)))?;
        step.input = serde_json::json!({
            "lead_id": lead.id,
            "opportunity_id": opportunity_id,
            "previous_status": lead.status.as_str(),
        });

        let event = lead
            .convert(
                opportunity_id,
                saga.customer_id,
                saga.contact_id,
                saga.initiated_by,
            )
            .map_err(step_error)?;
        uow.update_lead(&mut lead).await?;
        uow.enqueue_event(record(saga, lead.version.as_i64(), &event)?)
            .await?;

        Ok(serde_json::json!({
            "lead_id": lead.id,
            "status": lead.status.as_str(),
        }))
    }

    async fn compensate(
        &self,
        uow: &mut dyn Uow,
        saga: &mut ConversionSaga,
    ) -> Result<(), StepError> {
        let Some(mut lead) = uow.lead(saga.tenant_id, saga.lead_id).await? else {
            return Ok(());
        };
        let event = match lead.revert_conversion() {
            Ok(event) => event,
            // Already reverted, nothing to undo.
            Err(DomainError::LeadNotConverted) => return Ok(()),
            Err(other) => return Err(step_error(other)),
        };
        uow.update_lead(&mut lead).await?;
        uow.enqueue_event(record(saga, lead.version.as_i64(), &event)?)
            .await?;
        Ok(())
    }
}
