//! Transactional outbox rows and the claim handle used by processors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use common::TenantId;
use domain::EventRecord;

use crate::error::Result;

/// One event awaiting publication.
///
/// Inserted in the same transaction as the state change it announces,
/// then drained by the outbox processor. A row survives broker
/// failures: it is retried until published or until an operator steps
/// in past the retry cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_version: i64,
    pub payload: serde_json::Value,
    pub published: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Builds an outbox row from an event record. The row reuses the
    /// event's ID so consumers can deduplicate redeliveries.
    pub fn from_record(record: EventRecord) -> Self {
        let now = Utc::now();
        Self {
            id: record.event_id.as_uuid(),
            tenant_id: record.tenant_id,
            event_type: record.event_type,
            aggregate_id: record.aggregate_id,
            aggregate_type: record.aggregate_type,
            aggregate_version: record.version,
            payload: record.payload,
            published: false,
            published_at: None,
            retry_count: 0,
            last_error: None,
            occurred_at: record.occurred_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the broker routing key, `sales.<aggregate>.<action>`.
    pub fn routing_key(&self) -> String {
        format!("sales.{}", self.event_type)
    }
}

/// A batch of outbox rows claimed by one processor.
///
/// While the claim is held, its rows are invisible to concurrent
/// processors (lock-and-skip on the Postgres side, a claimed set in
/// memory). Each row's outcome is recorded through the claim, then
/// [`finish`](OutboxClaim::finish) releases it. Dropping a claim
/// without finishing releases the rows unmarked, so they are picked
/// up again: at-least-once, never lost.
#[async_trait]
pub trait OutboxClaim: Send {
    /// The claimed rows, oldest first.
    fn entries(&self) -> &[OutboxEntry];

    /// Marks a row as published after broker acknowledgment.
    async fn mark_published(&mut self, id: Uuid) -> Result<()>;

    /// Records a failed publish attempt: bumps the retry count and
    /// stores the error.
    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<()>;

    /// Commits the recorded outcomes and releases the claim.
    async fn finish(self: Box<Self>) -> Result<()>;
}
