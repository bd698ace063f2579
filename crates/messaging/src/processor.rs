//! Outbox processor: drains outbox rows to the broker.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use store::{OutboxClaim, Store, StoreError};

use crate::publisher::EventPublisher;

/// Processor tuning knobs.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Rows claimed per poll.
    pub batch_size: i64,
    /// Delay between polls for fresh rows.
    pub poll_interval: Duration,
    /// Delay between polls of the retry pool. Slower than the main
    /// loop so a broken broker is not hammered.
    pub retry_interval: Duration,
    /// Publish attempts per row before it is left for an operator.
    pub max_retries: i32,
    /// Published rows older than this are deleted.
    pub cleanup_age: chrono::Duration,
    /// Delay between cleanup passes.
    pub cleanup_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retry_interval: Duration::from_secs(30),
            max_retries: 5,
            cleanup_age: chrono::Duration::hours(24),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub published: usize,
    pub failed: usize,
}

/// Drains outbox rows through a publisher.
///
/// Three loops run independently once started: the main loop claims
/// fresh rows, the retry loop revisits failed rows under the retry
/// cap, and the cleanup loop deletes published rows past retention.
/// Any number of processors may run concurrently; the claim-read
/// keeps them off each other's rows.
pub struct OutboxProcessor<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    config: ProcessorConfig,
}

impl<S, P> OutboxProcessor<S, P>
where
    S: Store + 'static,
    P: EventPublisher + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, config: ProcessorConfig) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Claims and publishes one batch of fresh rows.
    #[tracing::instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainStats, StoreError> {
        let claim = self.store.claim_unpublished(self.config.batch_size).await?;
        self.publish_claim(claim).await
    }

    /// Claims and publishes one batch of previously-failed rows.
    #[tracing::instrument(skip(self))]
    pub async fn retry_once(&self) -> Result<DrainStats, StoreError> {
        let claim = self
            .store
            .claim_retryable(self.config.max_retries, self.config.batch_size)
            .await?;
        self.publish_claim(claim).await
    }

    /// Deletes published rows older than the retention age.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_once(&self) -> Result<u64, StoreError> {
        let cutoff = chrono::Utc::now() - self.config.cleanup_age;
        let removed = self.store.purge_published_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "purged published outbox rows");
        }
        Ok(removed)
    }

    async fn publish_claim(&self, mut claim: Box<dyn OutboxClaim>) -> Result<DrainStats, StoreError> {
        let entries = claim.entries().to_vec();
        let mut stats = DrainStats::default();
        for entry in entries {
            match self.publisher.publish(&entry).await {
                Ok(()) => {
                    claim.mark_published(entry.id).await?;
                    metrics::counter!("outbox_published_total").increment(1);
                    stats.published += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        retry_count = entry.retry_count,
                        %error,
                        "outbox publish failed"
                    );
                    claim.mark_failed(entry.id, &error.to_string()).await?;
                    metrics::counter!("outbox_publish_failures_total").increment(1);
                    stats.failed += 1;
                }
            }
        }
        claim.finish().await?;
        Ok(stats)
    }

    /// Starts the three background loops. They run until the returned
    /// handle is stopped.
    pub fn start(self: Arc<Self>) -> ProcessorHandle {
        let (stop, _) = watch::channel(false);

        let drain = {
            let processor = Arc::clone(&self);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(processor.config.poll_interval) => {
                            if let Err(error) = processor.drain_once().await {
                                tracing::error!(%error, "outbox drain pass failed");
                            }
                        }
                    }
                }
            })
        };

        let retry = {
            let processor = Arc::clone(&self);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(processor.config.retry_interval) => {
                            if let Err(error) = processor.retry_once().await {
                                tracing::error!(%error, "outbox retry pass failed");
                            }
                        }
                    }
                }
            })
        };

        let cleanup = {
            let processor = Arc::clone(&self);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(processor.config.cleanup_interval) => {
                            if let Err(error) = processor.cleanup_once().await {
                                tracing::error!(%error, "outbox cleanup pass failed");
                            }
                        }
                    }
                }
            })
        };

        ProcessorHandle {
            stop,
            tasks: vec![drain, retry, cleanup],
        }
    }
}

/// Handle over the running processor loops.
pub struct ProcessorHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessorHandle {
    /// Signals all loops to stop and waits for them to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
