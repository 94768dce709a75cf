use chrono::{DateTime, Utc};
use postgres::reindex::status::{self as db, ReindexStatusRow};
use postgres::schema::TenantSchema;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::bail;
use crate::error::{ErrorKind, ReindexResult};
use crate::types::{ReindexEntityType, ReindexStatusKind};

/// Progress of one entity type through a reindex run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexStatus {
    pub entity_type: ReindexEntityType,
    pub status: ReindexStatusKind,
    pub total_merge_ranges: u32,
    pub processed_merge_ranges: u32,
    pub total_upload_ranges: u32,
    pub processed_upload_ranges: u32,
    pub start_time_merge: Option<DateTime<Utc>>,
    pub end_time_merge: Option<DateTime<Utc>>,
    pub start_time_upload: Option<DateTime<Utc>>,
    pub end_time_upload: Option<DateTime<Utc>>,
}

impl ReindexStatus {
    /// A fresh ledger row with zeroed counters.
    pub fn new(entity_type: ReindexEntityType, status: ReindexStatusKind) -> Self {
        Self {
            entity_type,
            status,
            total_merge_ranges: 0,
            processed_merge_ranges: 0,
            total_upload_ranges: 0,
            processed_upload_ranges: 0,
            start_time_merge: None,
            end_time_merge: None,
            start_time_upload: None,
            end_time_upload: None,
        }
    }

    /// Whether every merge range has been processed. Failed runs are never complete, and
    /// neither is a phase that has not started or has no ranges to process.
    pub fn is_merge_completed(&self) -> bool {
        !self.status.is_failed()
            && self.start_time_merge.is_some()
            && self.total_merge_ranges > 0
            && self.processed_merge_ranges >= self.total_merge_ranges
    }

    pub fn is_upload_completed(&self) -> bool {
        !self.status.is_failed()
            && self.start_time_upload.is_some()
            && self.total_upload_ranges > 0
            && self.processed_upload_ranges >= self.total_upload_ranges
    }
}

impl TryFrom<ReindexStatusRow> for ReindexStatus {
    type Error = crate::error::ReindexError;

    fn try_from(row: ReindexStatusRow) -> Result<Self, Self::Error> {
        Ok(ReindexStatus {
            entity_type: row.entity_type.parse()?,
            status: row.status.parse()?,
            total_merge_ranges: u32::try_from(row.total_merge_ranges)?,
            processed_merge_ranges: u32::try_from(row.processed_merge_ranges)?,
            total_upload_ranges: u32::try_from(row.total_upload_ranges)?,
            processed_upload_ranges: u32::try_from(row.processed_upload_ranges)?,
            start_time_merge: row.start_time_merge,
            end_time_merge: row.end_time_merge,
            start_time_upload: row.start_time_upload,
            end_time_upload: row.end_time_upload,
        })
    }
}

impl TryFrom<&ReindexStatus> for ReindexStatusRow {
    type Error = crate::error::ReindexError;

    fn try_from(status: &ReindexStatus) -> Result<Self, Self::Error> {
        Ok(ReindexStatusRow {
            entity_type: status.entity_type.as_str().to_string(),
            status: status.status.as_str().to_string(),
            total_merge_ranges: i32::try_from(status.total_merge_ranges)?,
            processed_merge_ranges: i32::try_from(status.processed_merge_ranges)?,
            total_upload_ranges: i32::try_from(status.total_upload_ranges)?,
            processed_upload_ranges: i32::try_from(status.processed_upload_ranges)?,
            start_time_merge: status.start_time_merge,
            end_time_merge: status.end_time_merge,
            start_time_upload: status.start_time_upload,
            end_time_upload: status.end_time_upload,
        })
    }
}

/// The per entity type status ledger of a reindex run.
///
/// There is no setter for a successful phase. Completion is read from the counters, and the
/// completed statuses are only written when the orchestrator re-seeds the ledger.
#[derive(Debug, Clone)]
pub struct ReindexStatusRepository {
    pool: PgPool,
    schema: TenantSchema,
}

impl ReindexStatusRepository {
    pub fn new(pool: PgPool, schema: TenantSchema) -> Self {
        Self { pool, schema }
    }

    pub async fn get_reindex_statuses(&self) -> ReindexResult<Vec<ReindexStatus>> {
        let rows = db::get_reindex_statuses(&self.pool, &self.schema).await?;

        rows.into_iter().map(ReindexStatus::try_from).collect()
    }

    /// Replaces the whole ledger with `records`.
    pub async fn save_reindex_status_records(
        &self,
        records: &[ReindexStatus],
    ) -> ReindexResult<()> {
        let rows = records
            .iter()
            .map(ReindexStatusRow::try_from)
            .collect::<ReindexResult<Vec<_>>>()?;
        db::replace_reindex_statuses(&self.pool, &self.schema, &rows).await?;

        info!(schema = %self.schema, entity_types = records.len(), "seeded reindex statuses");

        Ok(())
    }

    /// Moves `entity_type` into the merge phase.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when the type is not seeded or has failed.
    pub async fn set_merge_reindex_started(
        &self,
        entity_type: ReindexEntityType,
        total_merge_ranges: u32,
    ) -> ReindexResult<()> {
        let updated = db::set_merge_started(
            &self.pool,
            &self.schema,
            entity_type.as_str(),
            ReindexStatusKind::MergeInProgress.as_str(),
            i32::try_from(total_merge_ranges)?,
        )
        .await?;

        if updated == 0 {
            bail!(
                ErrorKind::InvalidState,
                "Reindex status is missing or failed",
                entity_type
            );
        }

        info!(%entity_type, total_merge_ranges, "merge reindex started");

        Ok(())
    }

    /// Moves `entity_type` into the upload phase.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when the type is not seeded or has failed.
    pub async fn set_upload_reindex_started(
        &self,
        entity_type: ReindexEntityType,
        total_upload_ranges: u32,
    ) -> ReindexResult<()> {
        let updated = db::set_upload_started(
            &self.pool,
            &self.schema,
            entity_type.as_str(),
            ReindexStatusKind::UploadInProgress.as_str(),
            i32::try_from(total_upload_ranges)?,
        )
        .await?;

        if updated == 0 {
            bail!(
                ErrorKind::InvalidState,
                "Reindex status is missing or failed",
                entity_type
            );
        }

        info!(%entity_type, total_upload_ranges, "upload reindex started");

        Ok(())
    }

    pub async fn set_reindex_merge_failed(
        &self,
        entity_type: ReindexEntityType,
    ) -> ReindexResult<()> {
        self.set_failed(entity_type, ReindexStatusKind::MergeFailed).await
    }

    pub async fn set_reindex_upload_failed(
        &self,
        entity_type: ReindexEntityType,
    ) -> ReindexResult<()> {
        self.set_failed(entity_type, ReindexStatusKind::UploadFailed).await
    }

    pub async fn add_processed_merge_ranges(
        &self,
        entity_type: ReindexEntityType,
        count: u32,
    ) -> ReindexResult<ReindexStatus> {
        let row = db::add_processed_merge_ranges(
            &self.pool,
            &self.schema,
            entity_type.as_str(),
            i32::try_from(count)?,
        )
        .await?;

        let Some(row) = row else {
            bail!(ErrorKind::InvalidState, "Reindex status is missing", entity_type);
        };

        ReindexStatus::try_from(row)
    }

    pub async fn add_processed_upload_ranges(
        &self,
        entity_type: ReindexEntityType,
        count: u32,
    ) -> ReindexResult<ReindexStatus> {
        let row = db::add_processed_upload_ranges(
            &self.pool,
            &self.schema,
            entity_type.as_str(),
            i32::try_from(count)?,
        )
        .await?;

        let Some(row) = row else {
            bail!(ErrorKind::InvalidState, "Reindex status is missing", entity_type);
        };

        ReindexStatus::try_from(row)
    }

    async fn set_failed(
        &self,
        entity_type: ReindexEntityType,
        status: ReindexStatusKind,
    ) -> ReindexResult<()> {
        let updated = match status {
            ReindexStatusKind::MergeFailed => {
                db::set_merge_finished(
                    &self.pool,
                    &self.schema,
                    entity_type.as_str(),
                    status.as_str(),
                )
                .await?
            }
            _ => {
                db::set_upload_finished(
                    &self.pool,
                    &self.schema,
                    entity_type.as_str(),
                    status.as_str(),
                )
                .await?
            }
        };

        if updated == 0 {
            bail!(ErrorKind::InvalidState, "Reindex status is missing", entity_type);
        }

        warn!(%entity_type, %status, "reindex marked as failed");

        Ok(())
    }
}
