//! Store and unit-of-work abstractions.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use common::{LeadId, OpportunityId, PipelineId, SagaId, TenantId};
use domain::{ConversionSaga, EventRecord, IdempotencyKey, Lead, Opportunity, Pipeline, SagaStep};

use crate::error::Result;
use crate::outbox::OutboxClaim;

/// One atomic scope of work.
///
/// Everything done through a unit of work commits or rolls back
/// together, including outbox rows, so an event can never outlive (or
/// predate) the state change it describes. Transaction boundaries are
/// explicit: callers begin a scope, pass it down, and finish it with
/// [`commit`](Uow::commit) or [`rollback`](Uow::rollback). A scope
/// dropped without either rolls back.
#[async_trait]
pub trait Uow: Send {
    /// Loads a lead inside this scope.
    async fn lead(&mut self, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>>;

    /// Writes a lead, conditioned on its current version. On success
    /// the lead's version is incremented in place.
    async fn update_lead(&mut self, lead: &mut Lead) -> Result<()>;

    /// Loads a pipeline inside this scope.
    async fn pipeline(&mut self, tenant_id: TenantId, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn insert_opportunity(&mut self, opportunity: &Opportunity) -> Result<()>;

    /// Removes an opportunity. Tolerates a missing row so a
    /// compensation can run even if the apply never committed.
    async fn delete_opportunity(&mut self, tenant_id: TenantId, id: OpportunityId) -> Result<()>;

    async fn insert_saga(&mut self, saga: &ConversionSaga) -> Result<()>;

    /// Writes a saga, conditioned on its current version. On success
    /// the saga's version is incremented in place.
    async fn update_saga(&mut self, saga: &mut ConversionSaga) -> Result<()>;

    /// Appends one step attempt to the audit history.
    async fn record_step(&mut self, saga_id: SagaId, step: &SagaStep) -> Result<()>;

    /// Atomic insert-or-fetch of an idempotency key. Returns the
    /// stored mapping and true when this call created (or reclaimed an
    /// expired) entry, false when a live entry already existed.
    async fn get_or_create_idempotency(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<(IdempotencyKey, bool)>;

    /// Enqueues a domain event to the outbox.
    async fn enqueue_event(&mut self, record: EventRecord) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The persistence boundary of the conversion engine.
///
/// Plain reads run outside any transaction; mutations go through
/// [`begin`](Store::begin).
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a new unit of work.
    async fn begin(&self) -> Result<Box<dyn Uow>>;

    async fn lead(&self, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>>;

    async fn opportunity(
        &self,
        tenant_id: TenantId,
        id: OpportunityId,
    ) -> Result<Option<Opportunity>>;

    async fn pipeline(&self, tenant_id: TenantId, id: PipelineId) -> Result<Option<Pipeline>>;

    async fn saga(&self, tenant_id: TenantId, id: SagaId) -> Result<Option<ConversionSaga>>;

    async fn saga_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<ConversionSaga>>;

    /// All sagas recorded for a lead, oldest first.
    async fn sagas_for_lead(&self, tenant_id: TenantId, lead_id: LeadId)
    -> Result<Vec<ConversionSaga>>;

    /// Finds non-terminal sagas whose last update is older than the
    /// staleness threshold, oldest first, for the resume sweep.
    async fn stalled_sagas(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> Result<Vec<ConversionSaga>>;

    /// Returns the audit trail of step attempts for a saga.
    async fn step_history(&self, saga_id: SagaId) -> Result<Vec<SagaStep>>;

    async fn idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyKey>>;

    /// Deletes up to `batch` expired idempotency keys. Batched so the
    /// sweep never holds long-running locks. Returns rows removed.
    async fn purge_expired_idempotency_keys(&self, batch: i64) -> Result<u64>;

    /// Claims up to `limit` unpublished rows that have never failed,
    /// oldest first, skipping rows held by concurrent processors.
    async fn claim_unpublished(&self, limit: i64) -> Result<Box<dyn OutboxClaim>>;

    /// Claims up to `limit` previously-failed rows still under the
    /// retry cap. Rows past the cap are left for manual inspection.
    async fn claim_retryable(&self, max_retries: i32, limit: i64) -> Result<Box<dyn OutboxClaim>>;

    /// Counts rows not yet published, for observability.
    async fn unpublished_count(&self) -> Result<i64>;

    /// Outbox rows for one aggregate, oldest first, published or not.
    async fn events_for_aggregate(
        &self,
        tenant_id: TenantId,
        aggregate_id: uuid::Uuid,
    ) -> Result<Vec<crate::outbox::OutboxEntry>>;

    /// Deletes published outbox rows older than the cutoff. Returns
    /// rows removed.
    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Deletes terminal sagas (and their step history) whose
    /// completion is older than the cutoff. Returns sagas removed.
    async fn purge_finished_sagas_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
