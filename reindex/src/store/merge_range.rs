use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;

use chrono::{DateTime, Utc};
use postgres::reindex::merge_range::{self as db, MergeRangeRow};
use postgres::reindex::merge_target::{self as target_db, MergeTargetTable};
use postgres::schema::TenantSchema;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::batch::{BatchWriteOutcome, RowError, write_chunked};
use crate::bail;
use crate::error::{ErrorKind, ReindexResult};
use crate::store::merge_target::{
    MergeTargetSink, holding_row, instance_row, item_row, merge_target_table,
};
use crate::store::shared_entity::RawRecord;
use crate::tenant::ConsortiumTenantProvider;
use crate::types::{MergeRangeStatus, ReindexEntityType};

/// A unit of merge work: the `[lower, upper]` id interval of one entity type and tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRange {
    pub id: Uuid,
    pub entity_type: ReindexEntityType,
    pub tenant_id: String,
    pub lower: Uuid,
    pub upper: Uuid,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: MergeRangeStatus,
    pub fail_cause: Option<String>,
}

impl TryFrom<MergeRangeRow> for MergeRange {
    type Error = crate::error::ReindexError;

    fn try_from(row: MergeRangeRow) -> Result<Self, Self::Error> {
        Ok(MergeRange {
            id: row.id,
            entity_type: row.entity_type.parse()?,
            tenant_id: row.tenant_id,
            lower: row.lower,
            upper: row.upper,
            created_at: row.created_at,
            finished_at: row.finished_at,
            status: row.status.parse()?,
            fail_cause: row.fail_cause,
        })
    }
}

impl From<&MergeRange> for MergeRangeRow {
    fn from(range: &MergeRange) -> Self {
        MergeRangeRow {
            id: range.id,
            entity_type: range.entity_type.as_str().to_string(),
            tenant_id: range.tenant_id.clone(),
            lower: range.lower,
            upper: range.upper,
            created_at: range.created_at,
            finished_at: range.finished_at,
            status: range.status.as_str().to_string(),
            fail_cause: range.fail_cause.clone(),
        }
    }
}

/// Status transitions of merge ranges.
pub trait RangeStatusStore {
    fn update_range_status(
        &self,
        id: Uuid,
        finished_at: Option<DateTime<Utc>>,
        status: MergeRangeStatus,
        fail_cause: Option<&str>,
    ) -> impl Future<Output = ReindexResult<()>> + Send;
}

/// Outcome of [`MergeRangeRepository::save_entities`].
#[derive(Debug, Clone, Default)]
pub struct SaveEntitiesOutcome {
    /// Records that could not be turned into rows. Indexes refer to the input records.
    pub rejected: Vec<RowError>,
    /// Upserts of the accepted rows, indexed in acceptance order.
    pub written: BatchWriteOutcome,
}

impl SaveEntitiesOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.written.is_complete()
    }
}

/// Merge ranges and consolidated rows of one merge target entity type.
#[derive(Debug, Clone)]
pub struct MergeRangeRepository {
    pool: PgPool,
    schema: TenantSchema,
    entity_type: ReindexEntityType,
    table: MergeTargetTable,
    tenants: ConsortiumTenantProvider,
    batch_size: usize,
    instance_children_index_enabled: bool,
}

impl MergeRangeRepository {
    /// Fails when `entity_type` is not a merge target.
    pub fn new(
        pool: PgPool,
        schema: TenantSchema,
        entity_type: ReindexEntityType,
        tenants: ConsortiumTenantProvider,
        batch_size: usize,
        instance_children_index_enabled: bool,
    ) -> ReindexResult<Self> {
        let table = merge_target_table(entity_type)?;

        Ok(Self {
            pool,
            schema,
            entity_type,
            table,
            tenants,
            batch_size,
            instance_children_index_enabled,
        })
    }

    pub fn entity_type(&self) -> ReindexEntityType {
        self.entity_type
    }

    /// Inserts all `ranges` in one transaction.
    pub async fn save_merge_ranges(&self, ranges: &[MergeRange]) -> ReindexResult<()> {
        if let Some(range) = ranges.iter().find(|r| r.entity_type != self.entity_type) {
            bail!(
                ErrorKind::InvalidData,
                "Merge range belongs to another entity type",
                range.entity_type
            );
        }

        let rows = ranges.iter().map(MergeRangeRow::from).collect::<Vec<_>>();
        db::insert_merge_ranges(&self.pool, &self.schema, &rows).await?;

        info!(
            entity_type = %self.entity_type,
            ranges = ranges.len(),
            "saved merge ranges"
        );

        Ok(())
    }

    pub async fn get_merge_ranges(&self) -> ReindexResult<Vec<MergeRange>> {
        let rows =
            db::get_merge_ranges(&self.pool, &self.schema, self.entity_type.as_str()).await?;

        rows.into_iter().map(MergeRange::try_from).collect()
    }

    /// Returns the ranges that ended in [`MergeRangeStatus::Fail`]. These are the only ranges
    /// eligible for a retry pass.
    pub async fn get_failed_merge_ranges(&self) -> ReindexResult<Vec<MergeRange>> {
        let rows = db::get_merge_ranges_with_status(
            &self.pool,
            &self.schema,
            self.entity_type.as_str(),
            MergeRangeStatus::Fail.as_str(),
        )
        .await?;

        rows.into_iter().map(MergeRange::try_from).collect()
    }

    pub async fn update_range_status(
        &self,
        id: Uuid,
        finished_at: Option<DateTime<Utc>>,
        status: MergeRangeStatus,
        fail_cause: Option<&str>,
    ) -> ReindexResult<()> {
        let updated = db::update_merge_range_status(
            &self.pool,
            &self.schema,
            id,
            finished_at,
            status.as_str(),
            fail_cause,
        )
        .await?;

        if updated == 0 {
            bail!(ErrorKind::InvalidState, "Merge range does not exist", id);
        }

        debug!(range_id = %id, %status, "updated merge range status");

        Ok(())
    }

    /// Removes the merge ranges of every entity type.
    pub async fn truncate_merge_ranges(&self) -> ReindexResult<()> {
        db::truncate_merge_ranges(&self.pool, &self.schema).await?;
        info!(schema = %self.schema, "truncated merge ranges");

        Ok(())
    }

    /// Upserts raw records of `tenant_id` into the consolidated table.
    ///
    /// A record repeated within `records` is written once, with the content of its last
    /// occurrence. Instances are flagged as shared when `tenant_id` is the central tenant of
    /// its consortium.
    pub async fn save_entities(
        &self,
        tenant_id: &str,
        records: &[RawRecord],
    ) -> ReindexResult<SaveEntitiesOutcome> {
        let sink = MergeTargetSink {
            pool: &self.pool,
            schema: &self.schema,
        };
        let mut rejected = Vec::new();

        let written = match self.table {
            MergeTargetTable::Instance => {
                let shared = self.tenants.is_central_tenant(tenant_id).await?;
                let rows = collect_rows(records, &mut rejected, |record| {
                    instance_row(record, tenant_id, shared)
                });
                let rows = keep_last_by_id(rows, |row| row.id);
                write_chunked(&sink, &rows, self.batch_size).await
            }
            MergeTargetTable::Holding => {
                let rows = collect_rows(records, &mut rejected, |record| {
                    holding_row(record, tenant_id)
                });
                let rows = keep_last_by_id(rows, |row| row.id);
                write_chunked(&sink, &rows, self.batch_size).await
            }
            MergeTargetTable::Item => {
                let rows =
                    collect_rows(records, &mut rejected, |record| item_row(record, tenant_id));
                let rows = keep_last_by_id(rows, |row| row.id);
                write_chunked(&sink, &rows, self.batch_size).await
            }
        };

        debug!(
            entity_type = %self.entity_type,
            tenant_id,
            records = records.len(),
            rejected = rejected.len(),
            written = written.succeeded,
            "saved merge entities"
        );

        Ok(SaveEntitiesOutcome { rejected, written })
    }

    /// Deletes `ids` of `tenant_id`. See [`MergeRangeRepository::delete_entities`].
    pub async fn delete_entities_for_tenant(
        &self,
        ids: &[Uuid],
        tenant_id: &str,
        hard: bool,
    ) -> ReindexResult<u64> {
        self.delete(ids, Some(tenant_id), hard).await
    }

    /// Deletes `ids` for every tenant.
    ///
    /// Rows are only flagged as deleted when the instance children index is enabled and `hard`
    /// is not requested.
    pub async fn delete_entities(&self, ids: &[Uuid], hard: bool) -> ReindexResult<u64> {
        self.delete(ids, None, hard).await
    }

    async fn delete(
        &self,
        ids: &[Uuid],
        tenant_id: Option<&str>,
        hard: bool,
    ) -> ReindexResult<u64> {
        let soft = self.instance_children_index_enabled && !hard;
        let affected = target_db::delete_merge_entities(
            &self.pool,
            &self.schema,
            self.table,
            ids,
            tenant_id,
            soft,
        )
        .await?;

        debug!(
            entity_type = %self.entity_type,
            tenant_id,
            soft,
            affected,
            "deleted merge entities"
        );

        Ok(affected)
    }
}

impl RangeStatusStore for MergeRangeRepository {
    async fn update_range_status(
        &self,
        id: Uuid,
        finished_at: Option<DateTime<Utc>>,
        status: MergeRangeStatus,
        fail_cause: Option<&str>,
    ) -> ReindexResult<()> {
        MergeRangeRepository::update_range_status(self, id, finished_at, status, fail_cause).await
    }
}

fn collect_rows<R, F>(records: &[RawRecord], rejected: &mut Vec<RowError>, to_row: F) -> Vec<R>
where
    F: Fn(&RawRecord) -> ReindexResult<R>,
{
    let mut rows = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        match to_row(record) {
            Ok(row) => rows.push(row),
            Err(error) => rejected.push(RowError { index, error }),
        }
    }

    rows
}

/// Collapses rows sharing an id onto the position of the first one, keeping the last content.
/// A single upsert statement cannot touch the same row twice.
fn keep_last_by_id<R, F>(rows: Vec<R>, id: F) -> Vec<R>
where
    F: Fn(&R) -> Uuid,
{
    let mut positions = HashMap::with_capacity(rows.len());
    let mut unique: Vec<R> = Vec::with_capacity(rows.len());
    for row in rows {
        match positions.entry(id(&row)) {
            Entry::Occupied(entry) => unique[*entry.get()] = row,
            Entry::Vacant(entry) => {
                entry.insert(unique.len());
                unique.push(row);
            }
        }
    }

    unique
}
