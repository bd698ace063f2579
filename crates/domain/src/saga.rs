//! Conversion saga: the orchestration record for a lead-to-opportunity
//! conversion.
//!
//! The saga is an ordinary persisted aggregate. It carries the ordered
//! step list, the ids of resources created along the way, and the
//! diagnostics recorded when a step fails. The orchestrator in the
//! `conversion` crate drives it; this module only enforces the state
//! machine and step bookkeeping.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::{ContactId, CustomerId, LeadId, OpportunityId, PipelineId, SagaId, TenantId, UserId,
    Version};

use crate::error::{DomainError, StepError};
use crate::value_objects::Money;

/// The state of a conversion saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Started ──► Running ──┬──► Completed
///    │                  └──► Compensating ──► Compensated
///    │                           │
///    └───────────────────────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaState {
    /// Saga persisted, no step executed yet.
    #[default]
    Started,

    /// Steps are being executed.
    Running,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed terminally and completed steps are being undone.
    Compensating,

    /// Every completed step was undone after a failure (terminal state).
    Compensated,

    /// Compensation itself failed; manual intervention required
    /// (terminal state).
    Failed,
}

impl SagaState {
    /// Returns true if the saga may move from this state to `next`.
    pub fn can_transition_to(&self, next: SagaState) -> bool {
        use SagaState::*;
        matches!(
            (self, next),
            (Started, Running)
                | (Started, Failed)
                | (Running, Completed)
                | (Running, Compensating)
                | (Running, Failed)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Compensated | SagaState::Failed
        )
    }

    /// Returns the state name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Started => "started",
            SagaState::Running => "running",
            SagaState::Completed => "completed",
            SagaState::Compensating => "compensating",
            SagaState::Compensated => "compensated",
            SagaState::Failed => "failed",
        }
    }

    /// Parses a state from its database representation.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "started" => Ok(SagaState::Started),
            "running" => Ok(SagaState::Running),
            "completed" => Ok(SagaState::Completed),
            "compensating" => Ok(SagaState::Compensating),
            "compensated" => Ok(SagaState::Compensated),
            "failed" => Ok(SagaState::Failed),
            other => Err(DomainError::Validation(format!(
                "unknown saga state '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of work a saga step performs.
///
/// Each type maps to one apply/compensate handler pair in the step
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Create a customer record for the converting lead.
    CreateCustomer,
    /// Verify an existing customer supplied by the caller.
    LookupCustomer,
    /// Create a contact record under the customer.
    CreateContact,
    /// Create the opportunity in its pipeline's entry stage.
    CreateOpportunity,
    /// Flip the lead to Converted and record the conversion.
    MarkLeadConverted,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::CreateCustomer => "create_customer",
            StepType::LookupCustomer => "lookup_customer",
            StepType::CreateContact => "create_contact",
            StepType::CreateOpportunity => "create_opportunity",
            StepType::MarkLeadConverted => "mark_lead_converted",
        }
    }

    /// Parses a step type from its database representation.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "create_customer" => Ok(StepType::CreateCustomer),
            "lookup_customer" => Ok(StepType::LookupCustomer),
            "create_contact" => Ok(StepType::CreateContact),
            "create_opportunity" => Ok(StepType::CreateOpportunity),
            "mark_lead_converted" => Ok(StepType::MarkLeadConverted),
            other => Err(DomainError::Validation(format!(
                "unknown step type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Compensated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
        }
    }

    /// Parses a status from its database representation.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "compensated" => Ok(StepStatus::Compensated),
            other => Err(DomainError::Validation(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Default retry budget per step for transient failures.
pub const DEFAULT_STEP_RETRIES: i32 = 3;

/// One step of a conversion saga.
///
/// Input and output snapshots are kept for audit and replay. Output is
/// recorded only after a successful apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub id: Uuid,
    pub step_type: StepType,
    /// Position in the saga, fixed at creation.
    pub order: i32,
    pub status: StepStatus,
    /// Whether a completed step must be undone during compensation.
    pub compensatable: bool,
    /// Snapshot of the data the apply acted on, recorded by the
    /// handler before it does its work.
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
}

impl SagaStep {
    pub fn new(step_type: StepType, order: i32, compensatable: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_type,
            order,
            status: StepStatus::Pending,
            compensatable,
            input: serde_json::Value::Null,
            output: serde_json::Value::Null,
            error: None,
            retry_count: 0,
            max_retries: DEFAULT_STEP_RETRIES,
            started_at: None,
            completed_at: None,
            compensated_at: None,
        }
    }

    /// Marks the step as running, stamping the first attempt time.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Records a successful apply. The retry budget is reset so a
    /// later compensation gets a full budget of its own; the spent
    /// attempts remain visible in the step history.
    pub fn complete(&mut self, output: serde_json::Value) {
        self.status = StepStatus::Completed;
        self.output = output;
        self.error = None;
        self.retry_count = 0;
        self.completed_at = Some(Utc::now());
    }

    /// Records a transient failure and returns the step to pending so
    /// it can be re-executed.
    pub fn note_retry(&mut self, error: &StepError) {
        self.retry_count += 1;
        self.error = Some(error.to_string());
        self.status = StepStatus::Pending;
    }

    /// Records a transient compensation failure. The step stays
    /// `Completed` so it remains in the compensation plan.
    pub fn note_compensation_retry(&mut self, error: &StepError) {
        self.retry_count += 1;
        self.error = Some(error.to_string());
    }

    /// Records a terminal failure.
    pub fn fail(&mut self, error: &StepError) {
        self.status = StepStatus::Failed;
        self.error = Some(error.to_string());
    }

    /// Records a successful compensation.
    pub fn mark_compensated(&mut self) {
        self.status = StepStatus::Compensated;
        self.compensated_at = Some(Utc::now());
    }

    /// Returns true if the step has retry budget left.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Caller-supplied parameters for a conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub pipeline_id: PipelineId,
    /// Existing customer to attach the opportunity to. Ignored when
    /// `create_customer` is set.
    pub customer_id: Option<CustomerId>,
    pub create_customer: bool,
    pub create_contact: bool,
    pub owner_id: Option<UserId>,
    pub amount: Option<Money>,
    pub probability: Option<i32>,
    pub description: Option<String>,
    pub expected_close_date: Option<NaiveDate>,
}

impl ConversionRequest {
    pub fn new(pipeline_id: PipelineId) -> Self {
        Self {
            pipeline_id,
            customer_id: None,
            create_customer: false,
            create_contact: false,
            owner_id: None,
            amount: None,
            probability: None,
            description: None,
            expected_close_date: None,
        }
    }
}

/// The outcome of a completed conversion, answered to duplicate
/// requests without re-execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub lead_id: LeadId,
    pub opportunity_id: OpportunityId,
    pub opportunity_code: String,
    pub customer_id: Option<CustomerId>,
    pub contact_id: Option<ContactId>,
    pub customer_created: bool,
    pub converted_by: UserId,
    pub converted_at: DateTime<Utc>,
}

/// A lead-to-opportunity conversion in flight (or finished).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionSaga {
    pub id: SagaId,
    pub tenant_id: TenantId,
    pub lead_id: LeadId,
    /// Unique per tenant; duplicate requests resolve to this saga.
    pub idempotency_key: String,
    pub state: SagaState,
    /// Index of the next step to execute.
    pub current_step: usize,
    pub steps: Vec<SagaStep>,
    pub request: ConversionRequest,
    pub result: Option<ConversionResult>,
    pub opportunity_id: Option<OpportunityId>,
    pub customer_id: Option<CustomerId>,
    pub contact_id: Option<ContactId>,
    /// True when the customer was created by this saga rather than
    /// looked up.
    pub customer_created: bool,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub failed_step: Option<StepType>,
    pub initiated_by: UserId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversionSaga {
    /// Creates a saga in `Started` with its step list derived from the
    /// request. Step order is fixed here and never changes.
    pub fn new(
        tenant_id: TenantId,
        lead_id: LeadId,
        idempotency_key: impl Into<String>,
        initiated_by: UserId,
        request: ConversionRequest,
    ) -> Self {
        let mut steps = Vec::new();
        let mut order = 0;
        let mut push = |step_type: StepType, compensatable: bool| {
            steps.push(SagaStep::new(step_type, order, compensatable));
            order += 1;
        };

        if request.create_customer {
            // Customer records are left in place on rollback; cleanup
            // is a manual decision, so the step is not compensatable.
            push(StepType::CreateCustomer, false);
        } else if request.customer_id.is_some() {
            push(StepType::LookupCustomer, false);
        }
        if request.create_contact {
            push(StepType::CreateContact, true);
        }
        push(StepType::CreateOpportunity, true);
        push(StepType::MarkLeadConverted, true);

        let now = Utc::now();
        Self {
            id: SagaId::new(),
            tenant_id,
            lead_id,
            idempotency_key: idempotency_key.into(),
            state: SagaState::Started,
            current_step: 0,
            steps,
            request,
            result: None,
            opportunity_id: None,
            customer_id: None,
            contact_id: None,
            customer_created: false,
            error: None,
            error_code: None,
            failed_step: None,
            initiated_by,
            started_at: now,
            completed_at: None,
            version: Version::first(),
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: SagaState) -> Result<(), DomainError> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::InvalidSagaTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves the saga from `Started` to `Running`.
    pub fn begin(&mut self) -> Result<(), DomainError> {
        self.transition(SagaState::Running)
    }

    /// Returns the index of the next step to execute, skipping any
    /// steps already completed (relevant after a resume).
    pub fn next_pending_step(&self) -> Option<usize> {
        self.steps[self.current_step.min(self.steps.len())..]
            .iter()
            .position(|s| s.status != StepStatus::Completed)
            .map(|offset| self.current_step + offset)
    }

    /// Advances the step cursor past a completed step.
    pub fn advance_cursor(&mut self, past: usize) {
        self.current_step = past + 1;
        self.updated_at = Utc::now();
    }

    /// Returns true when every step has completed.
    pub fn all_steps_completed(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
    }

    /// Records a successful conversion and moves to `Completed`.
    pub fn complete(&mut self, result: ConversionResult) -> Result<(), DomainError> {
        self.transition(SagaState::Completed)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Records the failing step's diagnostics and moves to
    /// `Compensating`.
    pub fn begin_compensation(
        &mut self,
        failed_step: StepType,
        error: &StepError,
    ) -> Result<(), DomainError> {
        self.transition(SagaState::Compensating)?;
        self.error = Some(error.message.clone());
        self.error_code = Some(error.kind.code().to_string());
        self.failed_step = Some(failed_step);
        Ok(())
    }

    /// Moves to `Compensated` once every completed step was undone.
    pub fn mark_compensated(&mut self) -> Result<(), DomainError> {
        self.transition(SagaState::Compensated)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Moves to `Failed`. The failure ceiling: reached when
    /// compensation itself fails, or a saga cannot even start.
    pub fn fail(&mut self, error: &StepError, step: Option<StepType>) -> Result<(), DomainError> {
        self.transition(SagaState::Failed)?;
        self.error = Some(error.message.clone());
        self.error_code = Some(error.kind.code().to_string());
        if step.is_some() {
            self.failed_step = step;
        }
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Returns the indices of steps whose compensation must run, in
    /// reverse completion order. Steps already compensated are skipped
    /// so a resumed compensation never undoes twice.
    pub fn compensation_plan(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, s)| s.compensatable && s.status == StepStatus::Completed)
            .map(|(i, _)| i)
            .collect()
    }

    /// Records the customer this saga resolved to.
    pub fn set_customer(&mut self, id: CustomerId, created: bool) {
        self.customer_id = Some(id);
        self.customer_created = created;
    }

    /// Records the contact created by this saga.
    pub fn set_contact(&mut self, id: ContactId) {
        self.contact_id = Some(id);
    }

    /// Records the opportunity created by this saga.
    pub fn set_opportunity(&mut self, id: OpportunityId) {
        self.opportunity_id = Some(id);
    }

    /// Builds the conversion result from recorded resource ids.
    ///
    /// Only valid once the `CreateOpportunity` step has completed.
    pub fn build_result(&self, opportunity_code: String) -> Result<ConversionResult, DomainError> {
        let opportunity_id = self
            .opportunity_id
            .ok_or_else(|| DomainError::Validation("saga has no opportunity recorded".into()))?;
        Ok(ConversionResult {
            lead_id: self.lead_id,
            opportunity_id,
            opportunity_code,
            customer_id: self.customer_id,
            contact_id: self.contact_id,
            customer_created: self.customer_created,
            converted_by: self.initiated_by,
            converted_at: Utc::now(),
        })
    }
}
