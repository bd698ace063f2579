//! Background maintenance: the resume sweep and retention janitors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use store::Store;

use crate::engine::ConversionEngine;

/// Sweeper tuning knobs.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Delay between resume sweeps.
    pub sweep_interval: Duration,
    /// Delay between expired-key purges.
    pub key_purge_interval: Duration,
    /// Expired keys removed per purge pass.
    pub key_purge_batch: i64,
    /// Terminal sagas older than this are deleted.
    pub saga_retention: chrono::Duration,
    /// Delay between finished-saga purges.
    pub saga_purge_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            key_purge_interval: Duration::from_secs(60),
            key_purge_batch: 500,
            saga_retention: chrono::Duration::days(30),
            saga_purge_interval: Duration::from_secs(3600),
        }
    }
}

/// Runs the resume sweep and the retention janitors on intervals.
pub struct ResumeSweeper<S> {
    engine: Arc<ConversionEngine<S>>,
    store: Arc<S>,
    config: SweeperConfig,
}

impl<S: Store + 'static> ResumeSweeper<S> {
    pub fn new(engine: Arc<ConversionEngine<S>>, store: Arc<S>, config: SweeperConfig) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    /// Starts the background loops. They run until the returned handle
    /// is stopped.
    pub fn start(self: Arc<Self>) -> SweeperHandle {
        let (stop, _) = watch::channel(false);

        let sweep = {
            let sweeper = Arc::clone(&self);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(sweeper.config.sweep_interval) => {
                            match sweeper.engine.resume().await {
                                Ok(report) if report.resumed + report.skipped + report.failed > 0 => {
                                    tracing::info!(
                                        resumed = report.resumed,
                                        skipped = report.skipped,
                                        failed = report.failed,
                                        "resume sweep finished"
                                    );
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    tracing::error!(%error, "resume sweep failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        let key_purge = {
            let sweeper = Arc::clone(&self);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(sweeper.config.key_purge_interval) => {
                            match sweeper
                                .store
                                .purge_expired_idempotency_keys(sweeper.config.key_purge_batch)
                                .await
                            {
                                Ok(removed) if removed > 0 => {
                                    metrics::counter!("idempotency_keys_purged_total")
                                        .increment(removed);
                                    tracing::debug!(removed, "purged expired idempotency keys");
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    tracing::error!(%error, "idempotency key purge failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        let saga_purge = {
            let sweeper = Arc::clone(&self);
            let mut stop_rx = stop.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        _ = tokio::time::sleep(sweeper.config.saga_purge_interval) => {
                            let cutoff = chrono::Utc::now() - sweeper.config.saga_retention;
                            match sweeper.store.purge_finished_sagas_before(cutoff).await {
                                Ok(removed) if removed > 0 => {
                                    tracing::info!(removed, "purged finished sagas");
                                }
                                Ok(_) => {}
                                Err(error) => {
                                    tracing::error!(%error, "finished saga purge failed");
                                }
                            }
                        }
                    }
                }
            })
        };

        SweeperHandle {
            stop,
            tasks: vec![sweep, key_purge, saga_purge],
        }
    }
}

/// Handle over the running sweeper loops.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals all loops to stop and waits for them to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
