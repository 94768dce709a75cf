//! Incremental aggregation of shared entities.
//!
//! One cycle works on a single (entity type, tenant) pair and is serialized by the sub-resource
//! lock. The lock row stores the watermark: every entity updated after it, less a configurable
//! overlap window, is fetched page by page with a `(last_updated_date, id)` cursor and handed to
//! a [`SubResourceConsumer`]. The
//! lock timestamp is refreshed after each page, and on success the lock is released with the
//! largest timestamp seen as the new watermark. On failure the original watermark is restored.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use config::shared::SubResourcesConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, ReindexResult};
use crate::reindex_error;
use crate::store::lock::SubResourceLockStore;
use crate::store::shared_entity::{SharedEntityRecord, SubResourceSource};
use crate::types::SubResourceType;

/// Receives the pages of an aggregation cycle, e.g. to publish them to the index.
pub trait SubResourceConsumer {
    fn consume(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
        records: &[SharedEntityRecord],
    ) -> impl Future<Output = ReindexResult<()>> + Send;
}

/// Result of one aggregation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncCycleOutcome {
    /// The lock was held by someone else.
    Skipped,
    Completed {
        records: usize,
        /// Watermark stored when the lock was released.
        watermark: DateTime<Utc>,
    },
}

#[derive(Debug)]
pub struct SubResourcesSyncWorker<L, S, C> {
    locks: L,
    source: S,
    consumer: C,
    config: SubResourcesConfig,
}

impl<L, S, C> SubResourcesSyncWorker<L, S, C>
where
    L: SubResourceLockStore + Sync,
    S: SubResourceSource + Sync,
    C: SubResourceConsumer + Sync,
{
    pub fn new(locks: L, source: S, consumer: C, config: SubResourcesConfig) -> Self {
        Self {
            locks,
            source,
            consumer,
            config,
        }
    }

    /// Runs one aggregation cycle for `tenant_id`.
    pub async fn run_cycle(&self, tenant_id: &str) -> ReindexResult<SyncCycleOutcome> {
        let entity_type = self.source.sub_resource();

        self.locks
            .check_and_release_stale_lock(
                entity_type,
                tenant_id,
                self.config.stale_lock_threshold_ms,
            )
            .await?;

        let Some(watermark) = self.locks.lock_sub_resource(entity_type, tenant_id).await? else {
            debug!(%entity_type, tenant_id, "sub-resource cycle skipped, lock is held");
            return Ok(SyncCycleOutcome::Skipped);
        };

        match self.sync_pages(entity_type, tenant_id, watermark).await {
            Ok((records, new_watermark)) => {
                self.locks
                    .unlock_sub_resource(entity_type, new_watermark, tenant_id)
                    .await?;
                info!(
                    %entity_type,
                    tenant_id,
                    records,
                    watermark = %new_watermark,
                    "sub-resource cycle completed"
                );

                Ok(SyncCycleOutcome::Completed {
                    records,
                    watermark: new_watermark,
                })
            }
            Err(err) => {
                if let Err(unlock_err) = self
                    .locks
                    .unlock_sub_resource(entity_type, watermark, tenant_id)
                    .await
                {
                    error!(
                        %entity_type,
                        tenant_id,
                        error = %unlock_err.summary(),
                        "failed to release sub-resource lock after a failed cycle"
                    );
                }

                Err(err)
            }
        }
    }

    async fn sync_pages(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
        watermark: DateTime<Utc>,
    ) -> ReindexResult<(usize, DateTime<Utc>)> {
        let limit = self.config.fetch_limit;
        // Re-read a window below the watermark. Consumers are idempotent and the watermark
        // itself never moves backwards.
        let overlap = i64::try_from(self.config.watermark_overlap_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX);
        let mut cursor_timestamp = watermark
            .checked_sub_signed(overlap)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut cursor_id: Option<String> = None;
        let mut max_timestamp = watermark;
        let mut records = 0;

        loop {
            let page = self
                .source
                .fetch_by_timestamp(tenant_id, cursor_timestamp, cursor_id.as_deref(), limit)
                .await?;
            let Some(last) = page.records.last() else {
                break;
            };

            self.consumer
                .consume(entity_type, tenant_id, &page.records)
                .await?;

            records += page.records.len();
            cursor_timestamp = last.last_updated_date;
            cursor_id = Some(last.id.clone());
            if let Some(page_max) = page.max_timestamp {
                max_timestamp = max_timestamp.max(page_max);
            }

            self.locks
                .update_lock_timestamp(entity_type, max_timestamp, tenant_id)
                .await?;

            if page.records.len() < limit as usize {
                break;
            }
        }

        Ok((records, max_timestamp))
    }
}

impl<L, S, C> SubResourcesSyncWorker<L, S, C>
where
    L: SubResourceLockStore + Send + Sync + 'static,
    S: SubResourceSource + Send + Sync + 'static,
    C: SubResourceConsumer + Send + Sync + 'static,
{
    /// Runs a cycle for every tenant each `interval` until `shutdown_rx` fires.
    ///
    /// A failed cycle is logged and the loop moves on to the next tenant.
    pub fn start(
        self,
        tenant_ids: Vec<String>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<()>,
    ) -> SubResourcesSyncWorkerHandle {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        info!(
                            entity_type = %self.source.sub_resource(),
                            "sub-resource worker shutting down"
                        );
                        return Ok(());
                    }

                    _ = ticker.tick() => {
                        for tenant_id in &tenant_ids {
                            if let Err(err) = self.run_cycle(tenant_id).await {
                                warn!(
                                    tenant_id = %tenant_id,
                                    error = %err.summary(),
                                    "sub-resource cycle failed"
                                );
                            }
                        }
                    }
                }
            }
        });

        SubResourcesSyncWorkerHandle { handle }
    }
}

/// Handle of a running [`SubResourcesSyncWorker`].
#[derive(Debug)]
pub struct SubResourcesSyncWorkerHandle {
    handle: JoinHandle<ReindexResult<()>>,
}

impl SubResourcesSyncWorkerHandle {
    /// Waits for the worker to stop.
    pub async fn wait(self) -> ReindexResult<()> {
        self.handle.await.map_err(|err| {
            reindex_error!(
                ErrorKind::WorkerPanic,
                "Sub-resource worker panicked",
                source: err
            )
        })?
    }
}
