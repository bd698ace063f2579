//! A conversion's events travel from the outbox to the broker.

use std::sync::Arc;
use std::time::Duration;

use common::{TenantId, UserId};
use conversion::{
    ContactDirectory, ConversionEngine, CustomerDirectory, EngineConfig, MemoryContactDirectory,
    MemoryCustomerDirectory, StepRegistry,
};
use domain::{ConversionRequest, Lead, Pipeline, SagaState, Stage};
use messaging::{MemoryPublisher, OutboxProcessor, ProcessorConfig};
use store::{MemoryStore, Store};

#[tokio::test]
async fn completed_conversion_is_published_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let customers = Arc::new(MemoryCustomerDirectory::new());
    let contacts = Arc::new(MemoryContactDirectory::new());
    let registry = StepRegistry::standard(
        customers as Arc<dyn CustomerDirectory>,
        contacts as Arc<dyn ContactDirectory>,
        Duration::from_secs(5),
    );
    let engine = ConversionEngine::new(Arc::clone(&store), registry, EngineConfig::default());

    let tenant = TenantId::new();
    let mut lead = Lead::new(tenant, "Acme Corp", "Jane Doe", "jane@acme.test");
    lead.qualify().unwrap();
    store.insert_lead(&lead).await;
    let pipeline = Pipeline::new(tenant, "Default", vec![Stage::new("Prospecting", 1, 10)]);
    store.insert_pipeline(&pipeline).await;

    let mut request = ConversionRequest::new(pipeline.id);
    request.create_customer = true;
    request.create_contact = true;
    let saga = engine
        .convert(tenant, lead.id, UserId::new(), Some("k1".into()), request)
        .await
        .unwrap();
    assert_eq!(saga.state, SagaState::Completed);

    let publisher = Arc::new(MemoryPublisher::new());
    let processor = OutboxProcessor::new(
        Arc::clone(&store),
        Arc::clone(&publisher),
        ProcessorConfig::default(),
    );
    processor.drain_once().await.unwrap();

    let mut types = publisher.published_types().await;
    types.sort();
    assert_eq!(
        types,
        vec!["conversion.completed", "lead.converted", "opportunity.created"]
    );
    assert_eq!(store.unpublished_count().await.unwrap(), 0);

    // A second drain finds nothing: each event left the outbox once.
    processor.drain_once().await.unwrap();
    assert_eq!(publisher.published().await.len(), 3);

    // The per-aggregate event history remains queryable after
    // publication.
    let events = store
        .events_for_aggregate(tenant, saga.opportunity_id.unwrap().as_uuid())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "opportunity.created");
    assert!(events[0].published);
}
