use std::future::Future;

use chrono::{DateTime, Utc};
use postgres::reindex::lock;
use postgres::schema::SchemaResolver;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::ReindexResult;
use crate::types::SubResourceType;

/// Mutex and watermark of the sub-resources pass, one per (entity type, tenant).
///
/// The lock's age is measured from acquisition or the latest heartbeat, never from the
/// watermark, which is data time.
pub trait SubResourceLockStore {
    /// Takes the lock and returns its watermark, or `None` when someone else holds it.
    fn lock_sub_resource(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
    ) -> impl Future<Output = ReindexResult<Option<DateTime<Utc>>>> + Send;

    /// Releases the lock and stores `timestamp` as the next watermark.
    fn unlock_sub_resource(
        &self,
        entity_type: SubResourceType,
        timestamp: DateTime<Utc>,
        tenant_id: &str,
    ) -> impl Future<Output = ReindexResult<()>> + Send;

    /// Stores the watermark reached so far and renews the heartbeat of a held lock.
    fn update_lock_timestamp(
        &self,
        entity_type: SubResourceType,
        timestamp: DateTime<Utc>,
        tenant_id: &str,
    ) -> impl Future<Output = ReindexResult<()>> + Send;

    /// Releases a held lock whose last lock or heartbeat is older than `threshold_ms`. The
    /// watermark is left untouched. Returns whether a lock was released.
    fn check_and_release_stale_lock(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
        threshold_ms: u64,
    ) -> impl Future<Output = ReindexResult<bool>> + Send;
}

/// [`SubResourceLockStore`] backed by the `sub_resources_lock` table of each tenant schema.
#[derive(Debug, Clone)]
pub struct SubResourcesLockRepository {
    pool: PgPool,
    resolver: SchemaResolver,
}

impl SubResourcesLockRepository {
    pub fn new(pool: PgPool, resolver: SchemaResolver) -> Self {
        Self { pool, resolver }
    }
}

impl SubResourceLockStore for SubResourcesLockRepository {
    async fn lock_sub_resource(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
    ) -> ReindexResult<Option<DateTime<Utc>>> {
        let schema = self.resolver.schema_for(tenant_id)?;
        let watermark = lock::lock_sub_resource(&self.pool, &schema, entity_type.as_str()).await?;

        match watermark {
            Some(watermark) => {
                debug!(%entity_type, tenant_id, %watermark, "sub-resource lock acquired")
            }
            None => debug!(%entity_type, tenant_id, "sub-resource lock is held elsewhere"),
        }

        Ok(watermark)
    }

    async fn unlock_sub_resource(
        &self,
        entity_type: SubResourceType,
        timestamp: DateTime<Utc>,
        tenant_id: &str,
    ) -> ReindexResult<()> {
        let schema = self.resolver.schema_for(tenant_id)?;
        let updated =
            lock::unlock_sub_resource(&self.pool, &schema, entity_type.as_str(), timestamp)
                .await?;

        if updated == 0 {
            warn!(%entity_type, tenant_id, "no sub-resource lock row to release");
        } else {
            debug!(%entity_type, tenant_id, watermark = %timestamp, "sub-resource lock released");
        }

        Ok(())
    }

    async fn update_lock_timestamp(
        &self,
        entity_type: SubResourceType,
        timestamp: DateTime<Utc>,
        tenant_id: &str,
    ) -> ReindexResult<()> {
        let schema = self.resolver.schema_for(tenant_id)?;
        let updated =
            lock::update_lock_timestamp(&self.pool, &schema, entity_type.as_str(), timestamp)
                .await?;

        if updated == 0 {
            warn!(%entity_type, tenant_id, "heartbeat on a sub-resource lock that is not held");
        }

        Ok(())
    }

    async fn check_and_release_stale_lock(
        &self,
        entity_type: SubResourceType,
        tenant_id: &str,
        threshold_ms: u64,
    ) -> ReindexResult<bool> {
        let schema = self.resolver.schema_for(tenant_id)?;
        let released =
            lock::release_stale_lock(&self.pool, &schema, entity_type.as_str(), threshold_ms)
                .await?;

        if released {
            info!(%entity_type, tenant_id, threshold_ms, "released stale sub-resource lock");
        }

        Ok(released)
    }
}
