//! In-memory store for unit tests.
//!
//! Mirrors the PostgreSQL semantics: version-conditioned updates,
//! insert-or-fetch idempotency keys, and claim-based outbox draining.
//! A unit of work takes exclusive ownership of the whole state for its
//! lifetime, so scopes serialize instead of interleaving; rollback
//! restores a snapshot taken at begin.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use common::{LeadId, OpportunityId, PipelineId, SagaId, TenantId};
use domain::{ConversionSaga, EventRecord, IdempotencyKey, Lead, Opportunity, Pipeline, SagaStep};

use crate::error::{Result, StoreError};
use crate::outbox::{OutboxClaim, OutboxEntry};
use crate::store::{Store, Uow};

#[derive(Debug, Default, Clone)]
struct MemoryState {
    leads: HashMap<Uuid, Lead>,
    pipelines: HashMap<Uuid, Pipeline>,
    opportunities: HashMap<Uuid, Opportunity>,
    sagas: HashMap<Uuid, ConversionSaga>,
    idempotency: HashMap<(Uuid, String), IdempotencyKey>,
    outbox: Vec<OutboxEntry>,
    step_history: Vec<(Uuid, SagaStep)>,
    claimed: HashSet<Uuid>,
}

/// In-memory store implementation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a lead directly, outside any unit of work.
    pub async fn insert_lead(&self, lead: &Lead) {
        let mut state = self.state.lock().await;
        state.leads.insert(lead.id.as_uuid(), lead.clone());
    }

    /// Inserts a pipeline directly.
    pub async fn insert_pipeline(&self, pipeline: &Pipeline) {
        let mut state = self.state.lock().await;
        state
            .pipelines
            .insert(pipeline.id.as_uuid(), pipeline.clone());
    }

    /// All outbox rows, for assertions.
    pub async fn outbox_rows(&self) -> Vec<OutboxEntry> {
        self.state.lock().await.outbox.clone()
    }

    async fn claim_matching<F>(&self, limit: i64, matches: F) -> Result<Box<dyn OutboxClaim>>
    where
        F: Fn(&OutboxEntry) -> bool,
    {
        let mut state = self.state.lock().await;
        let mut entries: Vec<OutboxEntry> = state
            .outbox
            .iter()
            .filter(|e| !e.published && !state.claimed.contains(&e.id) && matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries.truncate(limit as usize);
        for entry in &entries {
            state.claimed.insert(entry.id);
        }
        Ok(Box::new(MemoryClaim {
            state: Arc::clone(&self.state),
            entries,
        }))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Uow>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemoryUow {
            guard,
            snapshot: Some(snapshot),
        }))
    }

    async fn lead(&self, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>> {
        let state = self.state.lock().await;
        Ok(get_lead(&state, tenant_id, id))
    }

    async fn opportunity(
        &self,
        tenant_id: TenantId,
        id: OpportunityId,
    ) -> Result<Option<Opportunity>> {
        let state = self.state.lock().await;
        Ok(state
            .opportunities
            .get(&id.as_uuid())
            .filter(|o| o.tenant_id == tenant_id)
            .cloned())
    }

    async fn pipeline(&self, tenant_id: TenantId, id: PipelineId) -> Result<Option<Pipeline>> {
        let state = self.state.lock().await;
        Ok(get_pipeline(&state, tenant_id, id))
    }

    async fn saga(&self, tenant_id: TenantId, id: SagaId) -> Result<Option<ConversionSaga>> {
        let state = self.state.lock().await;
        Ok(state
            .sagas
            .get(&id.as_uuid())
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn saga_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<ConversionSaga>> {
        let state = self.state.lock().await;
        Ok(state
            .sagas
            .values()
            .find(|s| s.tenant_id == tenant_id && s.idempotency_key == key)
            .cloned())
    }

    async fn sagas_for_lead(
        &self,
        tenant_id: TenantId,
        lead_id: LeadId,
    ) -> Result<Vec<ConversionSaga>> {
        let state = self.state.lock().await;
        let mut sagas: Vec<ConversionSaga> = state
            .sagas
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.lead_id == lead_id)
            .cloned()
            .collect();
        sagas.sort_by_key(|s| s.created_at);
        Ok(sagas)
    }

    async fn stalled_sagas(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> Result<Vec<ConversionSaga>> {
        let cutoff = Utc::now() - older_than;
        let state = self.state.lock().await;
        let mut stalled: Vec<ConversionSaga> = state
            .sagas
            .values()
            .filter(|s| !s.state.is_terminal() && s.updated_at < cutoff)
            .cloned()
            .collect();
        stalled.sort_by_key(|s| s.updated_at);
        stalled.truncate(limit as usize);
        Ok(stalled)
    }

    async fn step_history(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        let state = self.state.lock().await;
        Ok(state
            .step_history
            .iter()
            .filter(|(id, _)| *id == saga_id.as_uuid())
            .map(|(_, step)| step.clone())
            .collect())
    }

    async fn idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyKey>> {
        let state = self.state.lock().await;
        Ok(state
            .idempotency
            .get(&(tenant_id.as_uuid(), key.to_string()))
            .cloned())
    }

    async fn purge_expired_idempotency_keys(&self, batch: i64) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let expired: Vec<(Uuid, String)> = state
            .idempotency
            .iter()
            .filter(|(_, v)| v.is_expired(now))
            .map(|(k, _)| k.clone())
            .take(batch as usize)
            .collect();
        for k in &expired {
            state.idempotency.remove(k);
        }
        Ok(expired.len() as u64)
    }

    async fn claim_unpublished(&self, limit: i64) -> Result<Box<dyn OutboxClaim>> {
        self.claim_matching(limit, |e| e.retry_count == 0).await
    }

    async fn claim_retryable(&self, max_retries: i32, limit: i64) -> Result<Box<dyn OutboxClaim>> {
        self.claim_matching(limit, move |e| {
            e.retry_count > 0 && e.retry_count < max_retries
        })
        .await
    }

    async fn unpublished_count(&self) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state.outbox.iter().filter(|e| !e.published).count() as i64)
    }

    async fn events_for_aggregate(
        &self,
        tenant_id: TenantId,
        aggregate_id: Uuid,
    ) -> Result<Vec<OutboxEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.outbox.len();
        state
            .outbox
            .retain(|e| !(e.published && e.published_at.is_some_and(|at| at < cutoff)));
        Ok((before - state.outbox.len()) as u64)
    }

    async fn purge_finished_sagas_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let doomed: Vec<Uuid> = state
            .sagas
            .values()
            .filter(|s| {
                s.state.is_terminal() && s.completed_at.is_some_and(|at| at < cutoff)
            })
            .map(|s| s.id.as_uuid())
            .collect();
        for id in &doomed {
            state.sagas.remove(id);
        }
        state.step_history.retain(|(id, _)| !doomed.contains(id));
        Ok(doomed.len() as u64)
    }
}

/// Exclusive scope over the shared state. Holding the state lock for
/// the scope's lifetime gives the same isolation a transaction would.
struct MemoryUow {
    guard: OwnedMutexGuard<MemoryState>,
    /// Present until commit; restored on rollback or drop.
    snapshot: Option<MemoryState>,
}

impl Drop for MemoryUow {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
    }
}

#[async_trait]
impl Uow for MemoryUow {
    async fn lead(&mut self, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>> {
        Ok(get_lead(&self.guard, tenant_id, id))
    }

    async fn update_lead(&mut self, lead: &mut Lead) -> Result<()> {
        let id = lead.id.as_uuid();
        let stored = self.guard.leads.get_mut(&id).ok_or(StoreError::NotFound {
            aggregate: "lead",
            id,
        })?;
        if stored.version != lead.version {
            return Err(StoreError::VersionConflict {
                aggregate: "lead",
                id,
                expected: lead.version,
            });
        }
        lead.version = lead.version.next();
        *stored = lead.clone();
        Ok(())
    }

    async fn pipeline(&mut self, tenant_id: TenantId, id: PipelineId) -> Result<Option<Pipeline>> {
        Ok(get_pipeline(&self.guard, tenant_id, id))
    }

    async fn insert_opportunity(&mut self, opportunity: &Opportunity) -> Result<()> {
        self.guard
            .opportunities
            .insert(opportunity.id.as_uuid(), opportunity.clone());
        Ok(())
    }

    async fn delete_opportunity(&mut self, _tenant_id: TenantId, id: OpportunityId) -> Result<()> {
        self.guard.opportunities.remove(&id.as_uuid());
        Ok(())
    }

    async fn insert_saga(&mut self, saga: &ConversionSaga) -> Result<()> {
        self.guard.sagas.insert(saga.id.as_uuid(), saga.clone());
        Ok(())
    }

    async fn update_saga(&mut self, saga: &mut ConversionSaga) -> Result<()> {
        let id = saga.id.as_uuid();
        let stored = self.guard.sagas.get_mut(&id).ok_or(StoreError::NotFound {
            aggregate: "conversion_saga",
            id,
        })?;
        if stored.version != saga.version {
            return Err(StoreError::VersionConflict {
                aggregate: "conversion_saga",
                id,
                expected: saga.version,
            });
        }
        saga.version = saga.version.next();
        *stored = saga.clone();
        Ok(())
    }

    async fn record_step(&mut self, saga_id: SagaId, step: &SagaStep) -> Result<()> {
        self.guard
            .step_history
            .push((saga_id.as_uuid(), step.clone()));
        Ok(())
    }

    async fn get_or_create_idempotency(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<(IdempotencyKey, bool)> {
        let map_key = (key.tenant_id.as_uuid(), key.key.clone());
        let now = Utc::now();
        if let Some(existing) = self.guard.idempotency.get(&map_key)
            && !existing.is_expired(now)
        {
            return Ok((existing.clone(), false));
        }
        self.guard.idempotency.insert(map_key, key.clone());
        Ok((key.clone(), true))
    }

    async fn enqueue_event(&mut self, record: EventRecord) -> Result<()> {
        self.guard.outbox.push(OutboxEntry::from_record(record));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.guard = snapshot;
        }
        Ok(())
    }
}

/// A claimed in-memory batch. Rows enter a claimed set invisible to
/// other claims; marking an outcome releases the row, finish releases
/// whatever was left unmarked.
struct MemoryClaim {
    state: Arc<Mutex<MemoryState>>,
    entries: Vec<OutboxEntry>,
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        // A claim dropped without finishing must release its rows,
        // like the rolled-back row locks on the Postgres side.
        let ids: Vec<Uuid> = self.entries.iter().map(|e| e.id).collect();
        if ids.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = Arc::clone(&self.state);
            handle.spawn(async move {
                let mut state = state.lock().await;
                for id in ids {
                    state.claimed.remove(&id);
                }
            });
        }
    }
}

#[async_trait]
impl OutboxClaim for MemoryClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_published(&mut self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.outbox.iter_mut().find(|e| e.id == id) {
            row.published = true;
            row.published_at = Some(Utc::now());
            row.updated_at = Utc::now();
        }
        state.claimed.remove(&id);
        Ok(())
    }

    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(row) = state.outbox.iter_mut().find(|e| e.id == id) {
            row.retry_count += 1;
            row.last_error = Some(error.to_string());
            row.updated_at = Utc::now();
        }
        state.claimed.remove(&id);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock().await;
        for entry in &self.entries {
            state.claimed.remove(&entry.id);
        }
        Ok(())
    }
}

fn get_lead(state: &MemoryState, tenant_id: TenantId, id: LeadId) -> Option<Lead> {
    state
        .leads
        .get(&id.as_uuid())
        .filter(|l| l.tenant_id == tenant_id)
        .cloned()
}

fn get_pipeline(state: &MemoryState, tenant_id: TenantId, id: PipelineId) -> Option<Pipeline> {
    state
        .pipelines
        .get(&id.as_uuid())
        .filter(|p| p.tenant_id == tenant_id)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::DomainEvent;

    fn lead_fixture() -> Lead {
        let mut lead = Lead::new(TenantId::new(), "Acme Corp", "Jane Doe", "jane@acme.test");
        lead.qualify().unwrap();
        lead
    }

    #[tokio::test]
    async fn stale_version_update_is_rejected_and_state_unchanged() {
        let store = MemoryStore::new();
        let lead = lead_fixture();
        store.insert_lead(&lead).await;

        // First writer wins.
        let mut uow = store.begin().await.unwrap();
        let mut copy_a = uow.lead(lead.tenant_id, lead.id).await.unwrap().unwrap();
        copy_a.company_name = "Acme Holdings".into();
        uow.update_lead(&mut copy_a).await.unwrap();
        uow.commit().await.unwrap();

        // Second writer still holds the old version.
        let mut stale = lead.clone();
        stale.company_name = "Acme Industries".into();
        let mut uow = store.begin().await.unwrap();
        let err = uow.update_lead(&mut stale).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        uow.rollback().await.unwrap();

        let stored = store.lead(lead.tenant_id, lead.id).await.unwrap().unwrap();
        assert_eq!(stored.company_name, "Acme Holdings");
        assert_eq!(stored.version.as_i64(), 2);
    }

    #[tokio::test]
    async fn rollback_discards_all_writes_in_scope() {
        let store = MemoryStore::new();
        let lead = lead_fixture();
        store.insert_lead(&lead).await;

        let mut uow = store.begin().await.unwrap();
        let mut copy = uow.lead(lead.tenant_id, lead.id).await.unwrap().unwrap();
        copy.company_name = "Changed".into();
        uow.update_lead(&mut copy).await.unwrap();
        let record = EventRecord::new(
            lead.tenant_id,
            1,
            &DomainEvent::OpportunityDeleted {
                opportunity_id: OpportunityId::new(),
            },
        )
        .unwrap();
        uow.enqueue_event(record).await.unwrap();
        uow.rollback().await.unwrap();

        let stored = store.lead(lead.tenant_id, lead.id).await.unwrap().unwrap();
        assert_eq!(stored.company_name, "Acme Corp");
        assert!(store.outbox_rows().await.is_empty());
    }

    #[tokio::test]
    async fn dropped_scope_rolls_back() {
        let store = MemoryStore::new();
        let lead = lead_fixture();
        store.insert_lead(&lead).await;

        {
            let mut uow = store.begin().await.unwrap();
            let mut copy = uow.lead(lead.tenant_id, lead.id).await.unwrap().unwrap();
            copy.company_name = "Changed".into();
            uow.update_lead(&mut copy).await.unwrap();
            // Dropped without commit.
        }

        let stored = store.lead(lead.tenant_id, lead.id).await.unwrap().unwrap();
        assert_eq!(stored.company_name, "Acme Corp");
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_live_key() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let first = IdempotencyKey::new(tenant, "convert:x", Uuid::new_v4(), Duration::hours(1));

        let mut uow = store.begin().await.unwrap();
        let (_, created) = uow.get_or_create_idempotency(&first).await.unwrap();
        assert!(created);
        uow.commit().await.unwrap();

        let second = IdempotencyKey::new(tenant, "convert:x", Uuid::new_v4(), Duration::hours(1));
        let mut uow = store.begin().await.unwrap();
        let (stored, created) = uow.get_or_create_idempotency(&second).await.unwrap();
        assert!(!created);
        assert_eq!(stored.resource_id, first.resource_id);
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn expired_key_is_reclaimed() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();
        let expired =
            IdempotencyKey::new(tenant, "convert:x", Uuid::new_v4(), Duration::hours(-1));

        let mut uow = store.begin().await.unwrap();
        uow.get_or_create_idempotency(&expired).await.unwrap();
        uow.commit().await.unwrap();

        let fresh = IdempotencyKey::new(tenant, "convert:x", Uuid::new_v4(), Duration::hours(1));
        let mut uow = store.begin().await.unwrap();
        let (stored, created) = uow.get_or_create_idempotency(&fresh).await.unwrap();
        assert!(created);
        assert_eq!(stored.resource_id, fresh.resource_id);
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn claimed_rows_are_invisible_to_second_claim() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();

        let mut uow = store.begin().await.unwrap();
        for _ in 0..3 {
            let record = EventRecord::new(
                tenant,
                1,
                &DomainEvent::OpportunityDeleted {
                    opportunity_id: OpportunityId::new(),
                },
            )
            .unwrap();
            uow.enqueue_event(record).await.unwrap();
        }
        uow.commit().await.unwrap();

        let claim_a = store.claim_unpublished(10).await.unwrap();
        assert_eq!(claim_a.entries().len(), 3);

        let claim_b = store.claim_unpublished(10).await.unwrap();
        assert!(claim_b.entries().is_empty());

        // Releasing the first claim makes the rows claimable again.
        claim_a.finish().await.unwrap();
        let claim_c = store.claim_unpublished(10).await.unwrap();
        assert_eq!(claim_c.entries().len(), 3);
    }

    #[tokio::test]
    async fn mark_failed_moves_row_to_retry_pool() {
        let store = MemoryStore::new();
        let tenant = TenantId::new();

        let mut uow = store.begin().await.unwrap();
        let record = EventRecord::new(
            tenant,
            1,
            &DomainEvent::OpportunityDeleted {
                opportunity_id: OpportunityId::new(),
            },
        )
        .unwrap();
        uow.enqueue_event(record).await.unwrap();
        uow.commit().await.unwrap();

        let mut claim = store.claim_unpublished(10).await.unwrap();
        let id = claim.entries()[0].id;
        claim.mark_failed(id, "broker down").await.unwrap();
        claim.finish().await.unwrap();

        // No longer in the fresh pool, present in the retry pool.
        assert!(store.claim_unpublished(10).await.unwrap().entries().is_empty());
        let retry = store.claim_retryable(5, 10).await.unwrap();
        assert_eq!(retry.entries().len(), 1);
        assert_eq!(retry.entries()[0].retry_count, 1);
        assert_eq!(retry.entries()[0].last_error.as_deref(), Some("broker down"));
    }
}
