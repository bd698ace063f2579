//! PostgreSQL-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use common::{
    ContactId, CustomerId, LeadId, OpportunityId, PipelineId, SagaId, StageId, TenantId, UserId,
    Version,
};
use domain::{
    ConversionSaga, EventRecord, IdempotencyKey, Lead, LeadStatus, Money, Opportunity, Pipeline,
    SagaState, SagaStep, StepStatus, StepType,
};

use crate::error::{Result, StoreError};
use crate::outbox::{OutboxClaim, OutboxEntry};
use crate::store::{Store, Uow};

const NON_TERMINAL_STATES: [&str; 3] = ["started", "running", "compensating"];
const TERMINAL_STATES: [&str; 3] = ["completed", "compensated", "failed"];

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a fresh pool to the given database URL.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Inserts a lead directly. Lead capture itself is outside the
    /// conversion engine; this is the seam it enters through.
    pub async fn insert_lead(&self, lead: &Lead) -> Result<()> {
        insert_lead(&self.pool, lead).await
    }

    /// Inserts a pipeline directly.
    pub async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipelines (id, tenant_id, name, stages, is_default, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(pipeline.id.as_uuid())
        .bind(pipeline.tenant_id.as_uuid())
        .bind(&pipeline.name)
        .bind(serde_json::to_value(&pipeline.stages)?)
        .bind(pipeline.is_default)
        .bind(pipeline.version.as_i64())
        .bind(pipeline.created_at)
        .bind(pipeline.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn Uow>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUow { tx }))
    }

    async fn lead(&self, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>> {
        fetch_lead(&self.pool, tenant_id, id).await
    }

    async fn opportunity(
        &self,
        tenant_id: TenantId,
        id: OpportunityId,
    ) -> Result<Option<Opportunity>> {
        let row = sqlx::query("SELECT * FROM opportunities WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_opportunity).transpose()
    }

    async fn pipeline(&self, tenant_id: TenantId, id: PipelineId) -> Result<Option<Pipeline>> {
        fetch_pipeline(&self.pool, tenant_id, id).await
    }

    async fn saga(&self, tenant_id: TenantId, id: SagaId) -> Result<Option<ConversionSaga>> {
        let row = sqlx::query("SELECT * FROM conversion_sagas WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_saga).transpose()
    }

    async fn saga_by_idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<ConversionSaga>> {
        let row = sqlx::query(
            "SELECT * FROM conversion_sagas WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id.as_uuid())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_saga).transpose()
    }

    async fn sagas_for_lead(
        &self,
        tenant_id: TenantId,
        lead_id: LeadId,
    ) -> Result<Vec<ConversionSaga>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM conversion_sagas
            WHERE tenant_id = $1 AND lead_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(lead_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_saga).collect()
    }

    async fn stalled_sagas(
        &self,
        older_than: Duration,
        limit: i64,
    ) -> Result<Vec<ConversionSaga>> {
        let cutoff = Utc::now() - older_than;
        let rows = sqlx::query(
            r#"
            SELECT * FROM conversion_sagas
            WHERE state = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#,
        )
        .bind(&NON_TERMINAL_STATES[..])
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_saga).collect()
    }

    async fn step_history(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        let rows = sqlx::query(
            "SELECT * FROM saga_step_history WHERE saga_id = $1 ORDER BY recorded_at ASC",
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_history_step).collect()
    }

    async fn idempotency_key(
        &self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<IdempotencyKey>> {
        let row =
            sqlx::query("SELECT * FROM idempotency_keys WHERE tenant_id = $1 AND key = $2")
                .bind(tenant_id.as_uuid())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| row_to_idempotency(r, key)).transpose()?)
    }

    async fn purge_expired_idempotency_keys(&self, batch: i64) -> Result<u64> {
        // ctid-batched delete so the sweep never takes a long lock.
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_keys
            WHERE ctid IN (
                SELECT ctid FROM idempotency_keys
                WHERE expires_at <= now()
                LIMIT $1
            )
            "#,
        )
        .bind(batch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_unpublished(&self, limit: i64) -> Result<Box<dyn OutboxClaim>> {
        self.claim(
            r#"
            SELECT * FROM outbox
            WHERE NOT published AND retry_count = 0
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            None,
            limit,
        )
        .await
    }

    async fn claim_retryable(&self, max_retries: i32, limit: i64) -> Result<Box<dyn OutboxClaim>> {
        self.claim(
            r#"
            SELECT * FROM outbox
            WHERE NOT published AND retry_count > 0 AND retry_count < $2
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            Some(max_retries),
            limit,
        )
        .await
    }

    async fn unpublished_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE NOT published")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn events_for_aggregate(
        &self,
        tenant_id: TenantId,
        aggregate_id: Uuid,
    ) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM outbox
            WHERE tenant_id = $1 AND aggregate_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_outbox).collect()
    }

    async fn purge_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE published AND published_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn purge_finished_sagas_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            DELETE FROM saga_step_history
            WHERE saga_id IN (
                SELECT id FROM conversion_sagas
                WHERE state = ANY($1) AND completed_at < $2
            )
            "#,
        )
        .bind(&TERMINAL_STATES[..])
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "DELETE FROM conversion_sagas WHERE state = ANY($1) AND completed_at < $2",
        )
        .bind(&TERMINAL_STATES[..])
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

impl PostgresStore {
    async fn claim(
        &self,
        sql: &str,
        max_retries: Option<i32>,
        limit: i64,
    ) -> Result<Box<dyn OutboxClaim>> {
        let mut tx = self.pool.begin().await?;
        let mut query = sqlx::query(sql).bind(limit);
        if let Some(max) = max_retries {
            query = query.bind(max);
        }
        let rows = query.fetch_all(&mut *tx).await?;
        let entries = rows
            .into_iter()
            .map(row_to_outbox)
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(PgOutboxClaim { tx, entries }))
    }
}

/// A claimed outbox batch. The rows stay locked (`FOR UPDATE SKIP
/// LOCKED`) until the claim finishes, so no concurrent processor can
/// touch them. Dropping the claim rolls the transaction back: marks
/// are lost, rows unlock, and the batch is retried later.
struct PgOutboxClaim {
    tx: Transaction<'static, Postgres>,
    entries: Vec<OutboxEntry>,
}

#[async_trait]
impl OutboxClaim for PgOutboxClaim {
    fn entries(&self) -> &[OutboxEntry] {
        &self.entries
    }

    async fn mark_published(&mut self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET published = TRUE, published_at = now(), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET retry_count = retry_count + 1, last_error = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// A PostgreSQL transaction implementing the unit of work.
struct PgUow {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Uow for PgUow {
    async fn lead(&mut self, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>> {
        fetch_lead(&mut *self.tx, tenant_id, id).await
    }

    async fn update_lead(&mut self, lead: &mut Lead) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE leads
            SET company_name = $1, contact_name = $2, contact_email = $3,
                contact_phone = $4, website = $5, status = $6, owner_id = $7,
                conversion = $8, version = version + 1, updated_at = $9
            WHERE id = $10 AND tenant_id = $11 AND version = $12
            "#,
        )
        .bind(&lead.company_name)
        .bind(&lead.contact_name)
        .bind(&lead.contact_email)
        .bind(&lead.contact_phone)
        .bind(&lead.website)
        .bind(lead.status.as_str())
        .bind(lead.owner_id.map(|id| id.as_uuid()))
        .bind(
            lead.conversion
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
        )
        .bind(lead.updated_at)
        .bind(lead.id.as_uuid())
        .bind(lead.tenant_id.as_uuid())
        .bind(lead.version.as_i64())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .classify_missed_update("leads", "lead", lead.id.as_uuid(), lead.version)
                .await);
        }
        lead.version = lead.version.next();
        Ok(())
    }

    async fn pipeline(&mut self, tenant_id: TenantId, id: PipelineId) -> Result<Option<Pipeline>> {
        fetch_pipeline(&mut *self.tx, tenant_id, id).await
    }

    async fn insert_opportunity(&mut self, opportunity: &Opportunity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, tenant_id, code, name, lead_id, customer_id, customer_name,
                pipeline_id, stage_id, amount_cents, probability, description,
                expected_close_date, owner_id, created_by, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(opportunity.id.as_uuid())
        .bind(opportunity.tenant_id.as_uuid())
        .bind(&opportunity.code)
        .bind(&opportunity.name)
        .bind(opportunity.lead_id.map(|id| id.as_uuid()))
        .bind(opportunity.customer_id.as_uuid())
        .bind(&opportunity.customer_name)
        .bind(opportunity.pipeline_id.as_uuid())
        .bind(opportunity.stage_id.as_uuid())
        .bind(opportunity.amount.cents())
        .bind(opportunity.probability)
        .bind(&opportunity.description)
        .bind(opportunity.expected_close_date)
        .bind(opportunity.owner_id.map(|id| id.as_uuid()))
        .bind(opportunity.created_by.as_uuid())
        .bind(opportunity.version.as_i64())
        .bind(opportunity.created_at)
        .bind(opportunity.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_opportunity(&mut self, tenant_id: TenantId, id: OpportunityId) -> Result<()> {
        sqlx::query("DELETE FROM opportunities WHERE id = $1 AND tenant_id = $2")
            .bind(id.as_uuid())
            .bind(tenant_id.as_uuid())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_saga(&mut self, saga: &ConversionSaga) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversion_sagas (
                id, tenant_id, lead_id, idempotency_key, state, current_step,
                steps, request, result, opportunity_id, customer_id, contact_id,
                customer_created, error, error_code, failed_step, initiated_by,
                started_at, completed_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
            "#,
        )
        .bind(saga.id.as_uuid())
        .bind(saga.tenant_id.as_uuid())
        .bind(saga.lead_id.as_uuid())
        .bind(&saga.idempotency_key)
        .bind(saga.state.as_str())
        .bind(saga.current_step as i64)
        .bind(serde_json::to_value(&saga.steps)?)
        .bind(serde_json::to_value(&saga.request)?)
        .bind(saga.result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(saga.opportunity_id.map(|id| id.as_uuid()))
        .bind(saga.customer_id.map(|id| id.as_uuid()))
        .bind(saga.contact_id.map(|id| id.as_uuid()))
        .bind(saga.customer_created)
        .bind(&saga.error)
        .bind(&saga.error_code)
        .bind(saga.failed_step.map(|s| s.as_str()))
        .bind(saga.initiated_by.as_uuid())
        .bind(saga.started_at)
        .bind(saga.completed_at)
        .bind(saga.version.as_i64())
        .bind(saga.created_at)
        .bind(saga.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn update_saga(&mut self, saga: &mut ConversionSaga) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE conversion_sagas
            SET state = $1, current_step = $2, steps = $3, result = $4,
                opportunity_id = $5, customer_id = $6, contact_id = $7,
                customer_created = $8, error = $9, error_code = $10,
                failed_step = $11, completed_at = $12,
                version = version + 1, updated_at = $13
            WHERE id = $14 AND tenant_id = $15 AND version = $16
            "#,
        )
        .bind(saga.state.as_str())
        .bind(saga.current_step as i64)
        .bind(serde_json::to_value(&saga.steps)?)
        .bind(saga.result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(saga.opportunity_id.map(|id| id.as_uuid()))
        .bind(saga.customer_id.map(|id| id.as_uuid()))
        .bind(saga.contact_id.map(|id| id.as_uuid()))
        .bind(saga.customer_created)
        .bind(&saga.error)
        .bind(&saga.error_code)
        .bind(saga.failed_step.map(|s| s.as_str()))
        .bind(saga.completed_at)
        .bind(saga.updated_at)
        .bind(saga.id.as_uuid())
        .bind(saga.tenant_id.as_uuid())
        .bind(saga.version.as_i64())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .classify_missed_update(
                    "conversion_sagas",
                    "conversion_saga",
                    saga.id.as_uuid(),
                    saga.version,
                )
                .await);
        }
        saga.version = saga.version.next();
        Ok(())
    }

    async fn record_step(&mut self, saga_id: SagaId, step: &SagaStep) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_step_history (saga_id, step_type, step_order, status, input, output, error, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(step.step_type.as_str())
        .bind(step.order)
        .bind(step.status.as_str())
        .bind(&step.input)
        .bind(&step.output)
        .bind(&step.error)
        .bind(step.retry_count)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_or_create_idempotency(
        &mut self,
        key: &IdempotencyKey,
    ) -> Result<(IdempotencyKey, bool)> {
        // The uniqueness constraint resolves concurrent duplicates:
        // exactly one caller inserts (or reclaims an expired row), the
        // rest fall through to the select and get the winner's mapping.
        let row = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (tenant_id, key, resource_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (tenant_id, key) DO UPDATE
            SET resource_id = EXCLUDED.resource_id,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at
            WHERE idempotency_keys.expires_at <= now()
            RETURNING resource_id, expires_at, created_at
            "#,
        )
        .bind(key.tenant_id.as_uuid())
        .bind(&key.key)
        .bind(key.resource_id)
        .bind(key.expires_at)
        .bind(key.created_at)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok((
                IdempotencyKey {
                    key: key.key.clone(),
                    tenant_id: key.tenant_id,
                    resource_id: row.try_get("resource_id")?,
                    expires_at: row.try_get("expires_at")?,
                    created_at: row.try_get("created_at")?,
                },
                true,
            )),
            None => {
                let row = sqlx::query(
                    "SELECT resource_id, expires_at, created_at FROM idempotency_keys WHERE tenant_id = $1 AND key = $2",
                )
                .bind(key.tenant_id.as_uuid())
                .bind(&key.key)
                .fetch_one(&mut *self.tx)
                .await?;
                Ok((
                    IdempotencyKey {
                        key: key.key.clone(),
                        tenant_id: key.tenant_id,
                        resource_id: row.try_get("resource_id")?,
                        expires_at: row.try_get("expires_at")?,
                        created_at: row.try_get("created_at")?,
                    },
                    false,
                ))
            }
        }
    }

    async fn enqueue_event(&mut self, record: EventRecord) -> Result<()> {
        let entry = OutboxEntry::from_record(record);
        sqlx::query(
            r#"
            INSERT INTO outbox (
                id, tenant_id, event_type, aggregate_id, aggregate_type,
                aggregate_version, payload, published, published_at,
                retry_count, last_error, occurred_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id.as_uuid())
        .bind(&entry.event_type)
        .bind(entry.aggregate_id)
        .bind(&entry.aggregate_type)
        .bind(entry.aggregate_version)
        .bind(&entry.payload)
        .bind(entry.published)
        .bind(entry.published_at)
        .bind(entry.retry_count)
        .bind(&entry.last_error)
        .bind(entry.occurred_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl PgUow {
    /// Disambiguates a zero-row conditional update: missing row means
    /// not found, an existing row means a version conflict.
    async fn classify_missed_update(
        &mut self,
        table: &'static str,
        aggregate: &'static str,
        id: Uuid,
        expected: Version,
    ) -> StoreError {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = $1)");
        match sqlx::query_scalar::<_, bool>(&sql)
            .bind(id)
            .fetch_one(&mut *self.tx)
            .await
        {
            Ok(true) => StoreError::VersionConflict {
                aggregate,
                id,
                expected,
            },
            Ok(false) => StoreError::NotFound { aggregate, id },
            Err(e) => StoreError::Database(e),
        }
    }
}

async fn insert_lead<'e, E>(executor: E, lead: &Lead) -> Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO leads (
            id, tenant_id, company_name, contact_name, contact_email,
            contact_phone, website, status, owner_id, conversion,
            version, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(lead.id.as_uuid())
    .bind(lead.tenant_id.as_uuid())
    .bind(&lead.company_name)
    .bind(&lead.contact_name)
    .bind(&lead.contact_email)
    .bind(&lead.contact_phone)
    .bind(&lead.website)
    .bind(lead.status.as_str())
    .bind(lead.owner_id.map(|id| id.as_uuid()))
    .bind(
        lead.conversion
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?,
    )
    .bind(lead.version.as_i64())
    .bind(lead.created_at)
    .bind(lead.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn fetch_lead<'e, E>(executor: E, tenant_id: TenantId, id: LeadId) -> Result<Option<Lead>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query("SELECT * FROM leads WHERE id = $1 AND tenant_id = $2")
        .bind(id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(executor)
        .await?;
    row.map(row_to_lead).transpose()
}

async fn fetch_pipeline<'e, E>(
    executor: E,
    tenant_id: TenantId,
    id: PipelineId,
) -> Result<Option<Pipeline>>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query("SELECT * FROM pipelines WHERE id = $1 AND tenant_id = $2")
        .bind(id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(executor)
        .await?;
    row.map(row_to_pipeline).transpose()
}

fn row_to_lead(row: PgRow) -> Result<Lead> {
    let status: String = row.try_get("status")?;
    let conversion: Option<serde_json::Value> = row.try_get("conversion")?;
    Ok(Lead {
        id: LeadId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        company_name: row.try_get("company_name")?,
        contact_name: row.try_get("contact_name")?,
        contact_email: row.try_get("contact_email")?,
        contact_phone: row.try_get("contact_phone")?,
        website: row.try_get("website")?,
        status: LeadStatus::parse(&status)?,
        owner_id: row
            .try_get::<Option<Uuid>, _>("owner_id")?
            .map(UserId::from_uuid),
        conversion: conversion.map(serde_json::from_value).transpose()?,
        version: Version::new(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_pipeline(row: PgRow) -> Result<Pipeline> {
    let stages: serde_json::Value = row.try_get("stages")?;
    Ok(Pipeline {
        id: PipelineId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        name: row.try_get("name")?,
        stages: serde_json::from_value(stages)?,
        is_default: row.try_get("is_default")?,
        version: Version::new(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_opportunity(row: PgRow) -> Result<Opportunity> {
    Ok(Opportunity {
        id: OpportunityId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        code: row.try_get("code")?,
        name: row.try_get("name")?,
        lead_id: row
            .try_get::<Option<Uuid>, _>("lead_id")?
            .map(LeadId::from_uuid),
        customer_id: CustomerId::from_uuid(row.try_get("customer_id")?),
        customer_name: row.try_get("customer_name")?,
        pipeline_id: PipelineId::from_uuid(row.try_get("pipeline_id")?),
        stage_id: StageId::from_uuid(row.try_get("stage_id")?),
        amount: Money::from_cents(row.try_get("amount_cents")?),
        probability: row.try_get("probability")?,
        description: row.try_get("description")?,
        expected_close_date: row.try_get("expected_close_date")?,
        owner_id: row
            .try_get::<Option<Uuid>, _>("owner_id")?
            .map(UserId::from_uuid),
        created_by: UserId::from_uuid(row.try_get("created_by")?),
        version: Version::new(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_saga(row: PgRow) -> Result<ConversionSaga> {
    let state: String = row.try_get("state")?;
    let steps: serde_json::Value = row.try_get("steps")?;
    let request: serde_json::Value = row.try_get("request")?;
    let result: Option<serde_json::Value> = row.try_get("result")?;
    let failed_step: Option<String> = row.try_get("failed_step")?;
    Ok(ConversionSaga {
        id: SagaId::from_uuid(row.try_get("id")?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        lead_id: LeadId::from_uuid(row.try_get("lead_id")?),
        idempotency_key: row.try_get("idempotency_key")?,
        state: SagaState::parse(&state)?,
        current_step: row.try_get::<i64, _>("current_step")? as usize,
        steps: serde_json::from_value(steps)?,
        request: serde_json::from_value(request)?,
        result: result.map(serde_json::from_value).transpose()?,
        opportunity_id: row
            .try_get::<Option<Uuid>, _>("opportunity_id")?
            .map(OpportunityId::from_uuid),
        customer_id: row
            .try_get::<Option<Uuid>, _>("customer_id")?
            .map(CustomerId::from_uuid),
        contact_id: row
            .try_get::<Option<Uuid>, _>("contact_id")?
            .map(ContactId::from_uuid),
        customer_created: row.try_get("customer_created")?,
        error: row.try_get("error")?,
        error_code: row.try_get("error_code")?,
        failed_step: failed_step.map(|s| StepType::parse(&s)).transpose()?,
        initiated_by: UserId::from_uuid(row.try_get("initiated_by")?),
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        version: Version::new(row.try_get("version")?),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_history_step(row: PgRow) -> Result<SagaStep> {
    let step_type: String = row.try_get("step_type")?;
    let status: String = row.try_get("status")?;
    let mut step = SagaStep::new(StepType::parse(&step_type)?, row.try_get("step_order")?, false);
    step.id = row.try_get("id")?;
    step.status = StepStatus::parse(&status)?;
    step.input = row
        .try_get::<Option<serde_json::Value>, _>("input")?
        .unwrap_or(serde_json::Value::Null);
    step.output = row
        .try_get::<Option<serde_json::Value>, _>("output")?
        .unwrap_or(serde_json::Value::Null);
    step.error = row.try_get("error")?;
    step.retry_count = row.try_get("retry_count")?;
    Ok(step)
}

fn row_to_idempotency(row: PgRow, key: &str) -> Result<IdempotencyKey> {
    Ok(IdempotencyKey {
        key: key.to_string(),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        resource_id: row.try_get("resource_id")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_outbox(row: PgRow) -> Result<OutboxEntry> {
    Ok(OutboxEntry {
        id: row.try_get("id")?,
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id")?),
        event_type: row.try_get("event_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_version: row.try_get("aggregate_version")?,
        payload: row.try_get("payload")?,
        published: row.try_get("published")?,
        published_at: row.try_get("published_at")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        occurred_at: row.try_get("occurred_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
