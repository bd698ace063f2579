//! The publisher seam and its in-memory test double.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use store::OutboxEntry;

use crate::error::PublishError;

/// Publishes one outbox row to the broker.
///
/// Implementations must not report success before the broker has
/// durably accepted the message; the caller marks the row published
/// on `Ok` and a premature `Ok` would lose the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError>;
}

/// In-memory publisher for tests. Records everything published and
/// can be told to fail on demand.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    published: Arc<RwLock<Vec<OutboxEntry>>>,
    should_fail: Arc<AtomicBool>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail (or succeed again).
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    pub async fn published(&self) -> Vec<OutboxEntry> {
        self.published.read().await.clone()
    }

    /// Event types published so far, in order.
    pub async fn published_types(&self) -> Vec<String> {
        self.published
            .read()
            .await
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, entry: &OutboxEntry) -> Result<(), PublishError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(PublishError::Other("injected publish failure".into()));
        }
        self.published.write().await.push(entry.clone());
        Ok(())
    }
}
