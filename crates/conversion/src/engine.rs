//! The conversion orchestrator.
//!
//! Drives a [`ConversionSaga`] through its steps, one unit of work per
//! step attempt: the step's writes, its audit record and the saga
//! bookkeeping commit together or not at all. Transient failures are
//! retried up to the step budget; anything else triggers compensation
//! in reverse completion order. Every path through the engine is
//! resumable, so a crashed or stalled saga can be picked up by the
//! sweep and continued from its last committed point.

use std::sync::Arc;

use chrono::Utc;

use common::{LeadId, SagaId, TenantId, UserId};
use domain::{
    ConversionRequest, ConversionSaga, DomainEvent, EventRecord, IdempotencyKey, SagaState,
    StepType, conversion_key,
};
use store::{Store, StoreError};

use crate::error::{ConversionError, Result};
use crate::steps::StepRegistry;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Lifetime of an idempotency key; a duplicate request after this
    /// window starts fresh work.
    pub key_ttl: chrono::Duration,
    /// A non-terminal saga untouched for this long counts as stalled.
    pub stale_after: chrono::Duration,
    /// Stalled sagas picked up per resume sweep.
    pub resume_batch: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            key_ttl: chrono::Duration::hours(24),
            stale_after: chrono::Duration::minutes(10),
            resume_batch: 20,
        }
    }
}

/// What an initiation request resolved to.
#[derive(Debug)]
pub enum InitiateOutcome {
    /// A new saga was persisted and is ready to run.
    Accepted(ConversionSaga),
    /// The idempotency key already maps to a saga; here it is, in
    /// whatever state it has reached.
    Duplicate(ConversionSaga),
}

/// Outcome of one resume sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResumeReport {
    /// Sagas driven to a terminal state (or further along).
    pub resumed: usize,
    /// Sagas lost to a concurrent engine mid-run.
    pub skipped: usize,
    /// Sagas whose resume itself errored.
    pub failed: usize,
}

/// Drives conversion sagas against a store and a step registry.
pub struct ConversionEngine<S> {
    store: Arc<S>,
    registry: Arc<StepRegistry>,
    config: EngineConfig,
}

impl<S: Store> ConversionEngine<S> {
    pub fn new(store: Arc<S>, registry: StepRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Validates the request and persists a new saga, or resolves a
    /// duplicate to the saga its key already owns.
    ///
    /// Validation failures leave nothing behind: the idempotency key
    /// claim rolls back with the scope, so a corrected retry of the
    /// same key starts clean.
    #[tracing::instrument(skip(self, request), fields(tenant_id = %tenant_id, lead_id = %lead_id))]
    pub async fn initiate(
        &self,
        tenant_id: TenantId,
        lead_id: LeadId,
        initiated_by: UserId,
        idempotency_key: Option<String>,
        request: ConversionRequest,
    ) -> Result<InitiateOutcome> {
        if !request.create_customer && request.customer_id.is_none() {
            return Err(ConversionError::Validation(
                "conversion needs either create_customer or an existing customer_id".into(),
            ));
        }

        let key = idempotency_key
            .unwrap_or_else(|| conversion_key(lead_id, initiated_by, Utc::now()));
        let saga = ConversionSaga::new(tenant_id, lead_id, key.clone(), initiated_by, request);
        let claim = IdempotencyKey::new(tenant_id, key, saga.id.as_uuid(), self.config.key_ttl);

        let mut uow = self.store.begin().await?;
        let (stored, created) = uow.get_or_create_idempotency(&claim).await?;
        if !created {
            uow.rollback().await?;
            let owner = SagaId::from_uuid(stored.resource_id);
            let existing = self
                .store
                .saga(tenant_id, owner)
                .await?
                .ok_or(ConversionError::SagaNotFound(owner))?;
            tracing::debug!(saga_id = %existing.id, "duplicate conversion request");
            return Ok(InitiateOutcome::Duplicate(existing));
        }

        let Some(lead) = uow.lead(tenant_id, lead_id).await? else {
            uow.rollback().await?;
            return Err(ConversionError::LeadNotFound(lead_id));
        };
        if !lead.status.can_convert() {
            uow.rollback().await?;
            return Err(ConversionError::LeadNotConvertible {
                lead_id,
                status: lead.status,
            });
        }
        if uow.pipeline(tenant_id, saga.request.pipeline_id).await?.is_none() {
            uow.rollback().await?;
            return Err(ConversionError::PipelineNotFound(saga.request.pipeline_id));
        }

        uow.insert_saga(&saga).await?;
        uow.commit().await?;

        metrics::counter!("conversion_sagas_started_total").increment(1);
        tracing::info!(saga_id = %saga.id, steps = saga.steps.len(), "conversion saga started");
        Ok(InitiateOutcome::Accepted(saga))
    }

    /// Drives a saga until it reaches a terminal state.
    #[tracing::instrument(skip(self, saga), fields(saga_id = %saga.id, tenant_id = %saga.tenant_id))]
    pub async fn run(&self, saga: &mut ConversionSaga) -> Result<SagaState> {
        if saga.state == SagaState::Started {
            // Persisted together with the first step's commit.
            saga.begin()?;
        }
        while !saga.state.is_terminal() {
            match saga.state {
                SagaState::Running => self.advance_step(saga).await?,
                SagaState::Compensating => self.compensate_next(saga).await?,
                _ => break,
            }
        }
        Ok(saga.state)
    }

    /// Initiates and, for a fresh saga, runs it to completion. A
    /// duplicate returns the owning saga as-is.
    pub async fn convert(
        &self,
        tenant_id: TenantId,
        lead_id: LeadId,
        initiated_by: UserId,
        idempotency_key: Option<String>,
        request: ConversionRequest,
    ) -> Result<ConversionSaga> {
        match self
            .initiate(tenant_id, lead_id, initiated_by, idempotency_key, request)
            .await?
        {
            InitiateOutcome::Accepted(mut saga) => {
                self.run(&mut saga).await?;
                Ok(saga)
            }
            InitiateOutcome::Duplicate(saga) => Ok(saga),
        }
    }

    /// Picks up stalled sagas and drives each to a terminal state.
    ///
    /// A version conflict mid-run means another engine resumed the
    /// same saga concurrently; the loser backs off and lets the winner
    /// finish.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self) -> Result<ResumeReport> {
        let stalled = self
            .store
            .stalled_sagas(self.config.stale_after, self.config.resume_batch)
            .await?;
        let mut report = ResumeReport::default();
        for mut saga in stalled {
            let saga_id = saga.id;
            match self.run(&mut saga).await {
                Ok(state) => {
                    report.resumed += 1;
                    metrics::counter!("conversion_sagas_resumed_total").increment(1);
                    tracing::info!(%saga_id, %state, "resumed stalled saga");
                }
                Err(ConversionError::Store(StoreError::VersionConflict { .. })) => {
                    report.skipped += 1;
                    tracing::debug!(%saga_id, "saga taken over by a concurrent engine");
                }
                Err(error) => {
                    report.failed += 1;
                    tracing::error!(%saga_id, %error, "failed to resume saga");
                }
            }
        }
        Ok(report)
    }

    /// Executes the next pending step, or finalizes the saga when all
    /// steps have completed.
    async fn advance_step(&self, saga: &mut ConversionSaga) -> Result<()> {
        let Some(idx) = saga.next_pending_step() else {
            return self.finalize(saga).await;
        };
        let step_type = saga.steps[idx].step_type;
        let handler = self
            .registry
            .handler(step_type)
            .ok_or(ConversionError::NoHandler(step_type))?;

        // Resource ids recorded by a failed attempt must not survive
        // its rollback.
        let resources = (
            saga.opportunity_id,
            saga.customer_id,
            saga.contact_id,
            saga.customer_created,
        );

        let mut uow = self.store.begin().await?;
        // The handler works on a detached copy of the step so it can
        // record the input snapshot while it also borrows the saga.
        let mut step = saga.steps[idx].clone();
        step.start();
        let outcome = handler.apply(uow.as_mut(), saga, &mut step).await;
        saga.steps[idx] = step;
        match outcome {
            Ok(output) => {
                saga.steps[idx].complete(output);
                let step = saga.steps[idx].clone();
                uow.record_step(saga.id, &step).await?;
                saga.advance_cursor(idx);
                uow.update_saga(saga).await?;
                uow.commit().await?;
                tracing::debug!(saga_id = %saga.id, step = %step_type, "step completed");
            }
            Err(error) => {
                uow.rollback().await?;
                (
                    saga.opportunity_id,
                    saga.customer_id,
                    saga.contact_id,
                    saga.customer_created,
                ) = resources;

                if error.is_retryable() && saga.steps[idx].can_retry() {
                    saga.steps[idx].note_retry(&error);
                    let step = saga.steps[idx].clone();
                    let mut uow = self.store.begin().await?;
                    uow.record_step(saga.id, &step).await?;
                    uow.update_saga(saga).await?;
                    uow.commit().await?;
                    metrics::counter!("conversion_step_retries_total").increment(1);
                    tracing::warn!(
                        saga_id = %saga.id,
                        step = %step_type,
                        retry = step.retry_count,
                        %error,
                        "transient step failure, will retry"
                    );
                } else {
                    saga.steps[idx].fail(&error);
                    let step = saga.steps[idx].clone();
                    saga.begin_compensation(step_type, &error)?;
                    let mut uow = self.store.begin().await?;
                    uow.record_step(saga.id, &step).await?;
                    uow.update_saga(saga).await?;
                    uow.commit().await?;
                    metrics::counter!("conversion_steps_failed_total").increment(1);
                    tracing::warn!(
                        saga_id = %saga.id,
                        step = %step_type,
                        %error,
                        "step failed, compensating"
                    );
                }
            }
        }
        Ok(())
    }

    /// Undoes the next completed step, or closes the compensation once
    /// the plan is empty.
    async fn compensate_next(&self, saga: &mut ConversionSaga) -> Result<()> {
        let plan = saga.compensation_plan();
        let Some(&idx) = plan.first() else {
            let mut uow = self.store.begin().await?;
            saga.mark_compensated()?;
            uow.update_saga(saga).await?;
            let event = DomainEvent::ConversionCompensated {
                saga_id: saga.id,
                lead_id: saga.lead_id,
                reason: saga.error.clone().unwrap_or_default(),
            };
            uow.enqueue_event(
                EventRecord::new(saga.tenant_id, saga.version.as_i64(), &event)
                    .map_err(StoreError::from)?,
            )
            .await?;
            uow.commit().await?;
            metrics::counter!("conversion_sagas_compensated_total").increment(1);
            tracing::info!(saga_id = %saga.id, "saga compensated");
            return Ok(());
        };

        let step_type = saga.steps[idx].step_type;
        let handler = self
            .registry
            .handler(step_type)
            .ok_or(ConversionError::NoHandler(step_type))?;

        let mut uow = self.store.begin().await?;
        match handler.compensate(uow.as_mut(), saga).await {
            Ok(()) => {
                saga.steps[idx].mark_compensated();
                let step = saga.steps[idx].clone();
                uow.record_step(saga.id, &step).await?;
                uow.update_saga(saga).await?;
                uow.commit().await?;
                tracing::debug!(saga_id = %saga.id, step = %step_type, "step compensated");
            }
            Err(error) => {
                uow.rollback().await?;
                if error.is_retryable() && saga.steps[idx].can_retry() {
                    saga.steps[idx].note_compensation_retry(&error);
                    let step = saga.steps[idx].clone();
                    let mut uow = self.store.begin().await?;
                    uow.record_step(saga.id, &step).await?;
                    uow.update_saga(saga).await?;
                    uow.commit().await?;
                    metrics::counter!("conversion_step_retries_total").increment(1);
                    tracing::warn!(
                        saga_id = %saga.id,
                        step = %step_type,
                        %error,
                        "transient compensation failure, will retry"
                    );
                } else {
                    saga.steps[idx].fail(&error);
                    let step = saga.steps[idx].clone();
                    saga.fail(&error, Some(step_type))?;
                    let mut uow = self.store.begin().await?;
                    uow.record_step(saga.id, &step).await?;
                    uow.update_saga(saga).await?;
                    let event = DomainEvent::ConversionFailed {
                        saga_id: saga.id,
                        lead_id: saga.lead_id,
                        error: error.to_string(),
                    };
                    uow.enqueue_event(
                        EventRecord::new(saga.tenant_id, saga.version.as_i64(), &event)
                            .map_err(StoreError::from)?,
                    )
                    .await?;
                    uow.commit().await?;
                    metrics::counter!("conversion_sagas_failed_total").increment(1);
                    tracing::error!(
                        saga_id = %saga.id,
                        step = %step_type,
                        %error,
                        "compensation failed, manual intervention required"
                    );
                }
            }
        }
        Ok(())
    }

    /// Records the result and moves the saga to `Completed`.
    async fn finalize(&self, saga: &mut ConversionSaga) -> Result<()> {
        let code = recorded_opportunity_code(saga)
            .ok_or(ConversionError::MissingOpportunityCode(saga.id))?;
        let result = saga.build_result(code)?;
        let opportunity_id = result.opportunity_id;

        let mut uow = self.store.begin().await?;
        saga.complete(result)?;
        uow.update_saga(saga).await?;
        let event = DomainEvent::ConversionCompleted {
            saga_id: saga.id,
            lead_id: saga.lead_id,
            opportunity_id,
        };
        uow.enqueue_event(
            EventRecord::new(saga.tenant_id, saga.version.as_i64(), &event)
                .map_err(StoreError::from)?,
        )
        .await?;
        uow.commit().await?;

        metrics::counter!("conversion_sagas_completed_total").increment(1);
        tracing::info!(saga_id = %saga.id, %opportunity_id, "conversion completed");
        Ok(())
    }
}

fn recorded_opportunity_code(saga: &ConversionSaga) -> Option<String> {
    saga.steps
        .iter()
        .find(|s| s.step_type == StepType::CreateOpportunity)
        .and_then(|s| s.output.get("code"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}
