//! Tombstone retry sweep
//!
//! A standalone scheduled task that drains the vector tombstone queue:
//! failed index deletions are retried oldest-first in bounded batches until
//! they succeed. Deliberately a simple poll-and-retry loop, decoupled from
//! request handling; it only touches rows it dequeues by id, so it is safe
//! to run alongside live mutation traffic.

use crate::error::Result;
use crate::storage::MemoryStore;
use crate::vector::VectorIndex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sweep tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweep passes
    pub interval_secs: u64,
    /// Oldest-first tombstones retried per pass
    pub batch_size: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            batch_size: 50,
        }
    }
}

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepStats {
    pub retried: u64,
    pub cleared: u64,
    pub failed: u64,
}

/// Background tombstone sweeper
pub struct TombstoneSweeper {
    store: Arc<dyn MemoryStore>,
    vector: Arc<dyn VectorIndex>,
    config: SweepConfig,
    vector_timeout: Duration,
}

impl TombstoneSweeper {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        vector: Arc<dyn VectorIndex>,
        config: SweepConfig,
        vector_timeout: Duration,
    ) -> Self {
        Self {
            store,
            vector,
            config,
            vector_timeout,
        }
    }

    /// Run one bounded pass over the queue.
    ///
    /// Success removes the tombstone; failure increments its retry count and
    /// records the error, leaving the row for the next pass.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let batch = self
            .store
            .oldest_tombstones(self.config.batch_size)
            .await?;
        let mut stats = SweepStats::default();

        for entry in batch {
            stats.retried += 1;

            let outcome =
                match timeout(self.vector_timeout, self.vector.delete(&entry.external_id)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("vector index call timed out".to_string()),
                };

            match outcome {
                Ok(()) => {
                    self.store.remove_tombstone(&entry.external_id).await?;
                    stats.cleared += 1;
                }
                Err(error) => {
                    debug!(
                        external_id = %entry.external_id,
                        retry_count = entry.retry_count,
                        error,
                        "tombstone retry failed"
                    );
                    self.store
                        .record_tombstone_failure(&entry.external_id, &error)
                        .await?;
                    stats.failed += 1;
                }
            }
        }

        if stats.retried > 0 {
            info!(
                retried = stats.retried,
                cleared = stats.cleared,
                failed = stats.failed,
                "tombstone sweep pass complete"
            );
        }
        Ok(stats)
    }

    /// Spawn the interval loop; it runs until the shutdown channel fires
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            warn!(error = %e, "tombstone sweep pass failed");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("tombstone sweeper received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}
