//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use common::{PipelineId, TenantId, UserId};
use domain::{
    ConversionRequest, ConversionSaga, DomainEvent, EventRecord, IdempotencyKey, Lead, Pipeline,
    SagaState, Stage, StepError, StepType,
};
use store::{PostgresStore, Store, StoreError};

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/20250301000001_create_sales_schema.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE leads, pipelines, opportunities, conversion_sagas, saga_step_history, idempotency_keys, outbox",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

fn qualified_lead(tenant: TenantId) -> Lead {
    let mut lead = Lead::new(tenant, "Acme Corp", "Jane Doe", "jane@acme.test");
    lead.qualify().unwrap();
    lead
}

fn pipeline_fixture(tenant: TenantId) -> Pipeline {
    Pipeline::new(
        tenant,
        "Default",
        vec![
            Stage::new("Prospecting", 1, 10),
            Stage::new("Negotiation", 2, 60),
        ],
    )
}

fn saga_fixture(tenant: TenantId, key: &str) -> ConversionSaga {
    ConversionSaga::new(
        tenant,
        common::LeadId::new(),
        key,
        UserId::new(),
        ConversionRequest::new(PipelineId::new()),
    )
}

#[tokio::test]
#[serial]
async fn lead_roundtrip_preserves_fields() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let lead = qualified_lead(tenant);
    store.insert_lead(&lead).await.unwrap();

    let stored = store.lead(tenant, lead.id).await.unwrap().unwrap();
    assert_eq!(stored, lead);

    // Tenant scoping: invisible under another tenant.
    assert!(store.lead(TenantId::new(), lead.id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn stale_version_update_is_rejected_and_row_unchanged() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let lead = qualified_lead(tenant);
    store.insert_lead(&lead).await.unwrap();

    let mut uow = store.begin().await.unwrap();
    let mut winner = uow.lead(tenant, lead.id).await.unwrap().unwrap();
    winner.company_name = "Acme Holdings".into();
    uow.update_lead(&mut winner).await.unwrap();
    uow.commit().await.unwrap();
    assert_eq!(winner.version.as_i64(), 2);

    let mut stale = lead.clone();
    stale.company_name = "Acme Industries".into();
    let mut uow = store.begin().await.unwrap();
    let err = uow.update_lead(&mut stale).await.unwrap_err();
    assert!(matches!(err, StoreError::VersionConflict { .. }));
    uow.rollback().await.unwrap();

    let stored = store.lead(tenant, lead.id).await.unwrap().unwrap();
    assert_eq!(stored.company_name, "Acme Holdings");
    assert_eq!(stored.version.as_i64(), 2);
}

#[tokio::test]
#[serial]
async fn missing_row_update_reports_not_found() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let mut lead = qualified_lead(tenant);

    let mut uow = store.begin().await.unwrap();
    let err = uow.update_lead(&mut lead).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { aggregate: "lead", .. }));
    uow.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
async fn saga_roundtrip_and_versioned_update() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let mut saga = saga_fixture(tenant, "convert:abc");

    let mut uow = store.begin().await.unwrap();
    uow.insert_saga(&saga).await.unwrap();
    uow.commit().await.unwrap();

    let stored = store.saga(tenant, saga.id).await.unwrap().unwrap();
    assert_eq!(stored.state, SagaState::Started);
    assert_eq!(stored.steps.len(), 2);
    assert_eq!(stored.idempotency_key, "convert:abc");

    saga.begin().unwrap();
    saga.begin_compensation(StepType::CreateOpportunity, &StepError::fatal("boom"))
        .unwrap();
    let mut uow = store.begin().await.unwrap();
    uow.update_saga(&mut saga).await.unwrap();
    uow.commit().await.unwrap();

    let stored = store.saga(tenant, saga.id).await.unwrap().unwrap();
    assert_eq!(stored.state, SagaState::Compensating);
    assert_eq!(stored.error.as_deref(), Some("boom"));
    assert_eq!(stored.error_code.as_deref(), Some("fatal"));
    assert_eq!(stored.failed_step, Some(StepType::CreateOpportunity));
    assert_eq!(stored.version.as_i64(), 2);

    let by_key = store
        .saga_by_idempotency_key(tenant, "convert:abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_key.id, saga.id);
}

#[tokio::test]
#[serial]
async fn duplicate_idempotency_key_is_rejected_by_constraint() {
    let store = get_test_store().await;
    let tenant = TenantId::new();

    let mut uow = store.begin().await.unwrap();
    uow.insert_saga(&saga_fixture(tenant, "convert:dup")).await.unwrap();
    uow.commit().await.unwrap();

    let mut uow = store.begin().await.unwrap();
    let err = uow
        .insert_saga(&saga_fixture(tenant, "convert:dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Database(_)));
    uow.rollback().await.unwrap();
}

#[tokio::test]
#[serial]
async fn concurrent_get_or_create_yields_one_winner() {
    let store = Arc::new(get_test_store().await);
    let tenant = TenantId::new();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let key = IdempotencyKey::new(tenant, "convert:race", Uuid::new_v4(), Duration::hours(1));
            let mut uow = store.begin().await.unwrap();
            let (stored, created) = uow.get_or_create_idempotency(&key).await.unwrap();
            uow.commit().await.unwrap();
            (stored.resource_id, created)
        }));
    }

    let mut winners = 0;
    let mut resources = Vec::new();
    for handle in handles {
        let (resource, created) = handle.await.unwrap();
        if created {
            winners += 1;
        }
        resources.push(resource);
    }

    assert_eq!(winners, 1);
    // Every caller observes the winner's resource.
    assert!(resources.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
#[serial]
async fn expired_key_is_reclaimed_by_new_request() {
    let store = get_test_store().await;
    let tenant = TenantId::new();

    let expired = IdempotencyKey::new(tenant, "convert:ttl", Uuid::new_v4(), Duration::hours(-1));
    let mut uow = store.begin().await.unwrap();
    let (_, created) = uow.get_or_create_idempotency(&expired).await.unwrap();
    assert!(created);
    uow.commit().await.unwrap();

    let fresh = IdempotencyKey::new(tenant, "convert:ttl", Uuid::new_v4(), Duration::hours(1));
    let mut uow = store.begin().await.unwrap();
    let (stored, created) = uow.get_or_create_idempotency(&fresh).await.unwrap();
    assert!(created);
    assert_eq!(stored.resource_id, fresh.resource_id);
    uow.commit().await.unwrap();
}

#[tokio::test]
#[serial]
async fn expired_keys_are_purged_in_batches() {
    let store = get_test_store().await;
    let tenant = TenantId::new();

    let mut uow = store.begin().await.unwrap();
    for i in 0..5 {
        let key = IdempotencyKey::new(
            tenant,
            format!("stale:{i}"),
            Uuid::new_v4(),
            Duration::hours(-1),
        );
        uow.get_or_create_idempotency(&key).await.unwrap();
    }
    let live = IdempotencyKey::new(tenant, "live", Uuid::new_v4(), Duration::hours(1));
    uow.get_or_create_idempotency(&live).await.unwrap();
    uow.commit().await.unwrap();

    assert_eq!(store.purge_expired_idempotency_keys(3).await.unwrap(), 3);
    assert_eq!(store.purge_expired_idempotency_keys(10).await.unwrap(), 2);
    assert!(store.idempotency_key(tenant, "live").await.unwrap().is_some());
}

async fn enqueue_events(store: &PostgresStore, tenant: TenantId, count: usize) {
    let mut uow = store.begin().await.unwrap();
    for _ in 0..count {
        let record = EventRecord::new(
            tenant,
            1,
            &DomainEvent::OpportunityDeleted {
                opportunity_id: common::OpportunityId::new(),
            },
        )
        .unwrap();
        uow.enqueue_event(record).await.unwrap();
    }
    uow.commit().await.unwrap();
}

#[tokio::test]
#[serial]
async fn claimed_outbox_rows_are_skipped_by_second_claim() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    enqueue_events(&store, tenant, 3).await;

    let claim_a = store.claim_unpublished(10).await.unwrap();
    assert_eq!(claim_a.entries().len(), 3);

    // Rows locked by the first claim are invisible, not waited on.
    let claim_b = store.claim_unpublished(10).await.unwrap();
    assert!(claim_b.entries().is_empty());
    claim_b.finish().await.unwrap();

    // An unfinished claim releases its rows unmarked.
    drop(claim_a);
    // The dropped transaction rolls back asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let claim_c = store.claim_unpublished(10).await.unwrap();
    assert_eq!(claim_c.entries().len(), 3);
    claim_c.finish().await.unwrap();
}

#[tokio::test]
#[serial]
async fn published_and_failed_marks_are_recorded() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    enqueue_events(&store, tenant, 2).await;

    let mut claim = store.claim_unpublished(10).await.unwrap();
    let ok_id = claim.entries()[0].id;
    let bad_id = claim.entries()[1].id;
    claim.mark_published(ok_id).await.unwrap();
    claim.mark_failed(bad_id, "connection refused").await.unwrap();
    claim.finish().await.unwrap();

    assert_eq!(store.unpublished_count().await.unwrap(), 1);

    // The failed row is only reachable through the retry pool.
    assert!(store.claim_unpublished(10).await.unwrap().entries().is_empty());
    let retry = store.claim_retryable(5, 10).await.unwrap();
    assert_eq!(retry.entries().len(), 1);
    assert_eq!(retry.entries()[0].id, bad_id);
    assert_eq!(retry.entries()[0].retry_count, 1);
    assert_eq!(
        retry.entries()[0].last_error.as_deref(),
        Some("connection refused")
    );
    retry.finish().await.unwrap();

    // Rows at the cap are left for manual inspection.
    let capped = store.claim_retryable(1, 10).await.unwrap();
    assert!(capped.entries().is_empty());
    capped.finish().await.unwrap();
}

#[tokio::test]
#[serial]
async fn aggregate_event_history_is_queryable() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let opportunity_id = common::OpportunityId::new();

    let mut uow = store.begin().await.unwrap();
    let created = DomainEvent::OpportunityCreated {
        opportunity_id,
        code: "OPP-1A2B3C4D".into(),
        lead_id: None,
        customer_id: common::CustomerId::new(),
        pipeline_id: PipelineId::new(),
        stage_id: common::StageId::new(),
    };
    uow.enqueue_event(EventRecord::new(tenant, 1, &created).unwrap())
        .await
        .unwrap();
    let deleted = DomainEvent::OpportunityDeleted { opportunity_id };
    uow.enqueue_event(EventRecord::new(tenant, 2, &deleted).unwrap())
        .await
        .unwrap();
    let unrelated = DomainEvent::OpportunityDeleted {
        opportunity_id: common::OpportunityId::new(),
    };
    uow.enqueue_event(EventRecord::new(tenant, 1, &unrelated).unwrap())
        .await
        .unwrap();
    uow.commit().await.unwrap();

    let events = store
        .events_for_aggregate(tenant, opportunity_id.as_uuid())
        .await
        .unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["opportunity.created", "opportunity.deleted"]);
    assert_eq!(events[0].aggregate_version, 1);
    assert_eq!(events[1].aggregate_version, 2);

    // Tenant scoping: invisible under another tenant.
    assert!(store
        .events_for_aggregate(TenantId::new(), opportunity_id.as_uuid())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
#[serial]
async fn published_rows_are_purged_after_retention() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    enqueue_events(&store, tenant, 2).await;

    let mut claim = store.claim_unpublished(10).await.unwrap();
    let id = claim.entries()[0].id;
    claim.mark_published(id).await.unwrap();
    claim.finish().await.unwrap();

    // Unpublished rows survive any cutoff.
    let purged = store
        .purge_published_before(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert_eq!(store.unpublished_count().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn stalled_sagas_reports_only_old_non_terminal() {
    let store = get_test_store().await;
    let tenant = TenantId::new();

    let mut stuck = saga_fixture(tenant, "stuck");
    stuck.begin().unwrap();
    let fresh = saga_fixture(tenant, "fresh");
    let mut finished = saga_fixture(tenant, "finished");
    finished.begin().unwrap();
    finished
        .begin_compensation(StepType::CreateOpportunity, &StepError::fatal("x"))
        .unwrap();
    finished.mark_compensated().unwrap();

    let mut uow = store.begin().await.unwrap();
    uow.insert_saga(&stuck).await.unwrap();
    uow.insert_saga(&fresh).await.unwrap();
    uow.insert_saga(&finished).await.unwrap();
    uow.commit().await.unwrap();

    // Age the rows artificially.
    sqlx::query("UPDATE conversion_sagas SET updated_at = now() - interval '10 minutes' WHERE idempotency_key IN ('stuck', 'finished')")
        .execute(store.pool())
        .await
        .unwrap();

    let stalled = store.stalled_sagas(Duration::minutes(5), 10).await.unwrap();
    let keys: Vec<_> = stalled.iter().map(|s| s.idempotency_key.as_str()).collect();
    assert_eq!(keys, vec!["stuck"]);
}

#[tokio::test]
#[serial]
async fn step_history_is_append_only_audit() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let mut saga = saga_fixture(tenant, "audit");

    let mut uow = store.begin().await.unwrap();
    uow.insert_saga(&saga).await.unwrap();
    saga.steps[0].start();
    saga.steps[0].input = serde_json::json!({"customer_id": "c-1"});
    uow.record_step(saga.id, &saga.steps[0]).await.unwrap();
    saga.steps[0].complete(serde_json::json!({"opportunity_id": "x"}));
    uow.record_step(saga.id, &saga.steps[0]).await.unwrap();
    uow.commit().await.unwrap();

    let history = store.step_history(saga.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].step_type, StepType::CreateOpportunity);
    assert_eq!(history[0].status, domain::StepStatus::Running);
    assert_eq!(history[0].input, serde_json::json!({"customer_id": "c-1"}));
    assert_eq!(history[1].status, domain::StepStatus::Completed);
    assert_eq!(history[1].input, serde_json::json!({"customer_id": "c-1"}));
}

#[tokio::test]
#[serial]
async fn finished_sagas_are_purged_with_history() {
    let store = get_test_store().await;
    let tenant = TenantId::new();

    let mut done = saga_fixture(tenant, "done");
    done.begin().unwrap();
    done.begin_compensation(StepType::CreateOpportunity, &StepError::fatal("x"))
        .unwrap();
    done.mark_compensated().unwrap();
    let open = saga_fixture(tenant, "open");

    let mut uow = store.begin().await.unwrap();
    uow.insert_saga(&done).await.unwrap();
    uow.record_step(done.id, &done.steps[0]).await.unwrap();
    uow.insert_saga(&open).await.unwrap();
    uow.commit().await.unwrap();

    let purged = store
        .purge_finished_sagas_before(Utc::now() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(store.saga(tenant, done.id).await.unwrap().is_none());
    assert!(store.step_history(done.id).await.unwrap().is_empty());
    assert!(store.saga(tenant, open.id).await.unwrap().is_some());
}

#[tokio::test]
#[serial]
async fn pipeline_roundtrip() {
    let store = get_test_store().await;
    let tenant = TenantId::new();
    let pipeline = pipeline_fixture(tenant);
    store.insert_pipeline(&pipeline).await.unwrap();

    let stored = store.pipeline(tenant, pipeline.id).await.unwrap().unwrap();
    assert_eq!(stored, pipeline);
    assert_eq!(stored.entry_stage().unwrap().name, "Prospecting");
}
