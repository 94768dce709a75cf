use chrono::{DateTime, Utc};
use postgres::reindex::merge_target::{self as target_db, InstanceDocumentRow};
use postgres::reindex::upload_range::{self as db, UploadRangeRow};
use postgres::schema::TenantSchema;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, ReindexResult};
use crate::ranges::build_upload_ranges;
use crate::store::shared_entity::SharedEntityRepository;
use crate::types::ReindexEntityType;

/// A page of the consolidated data set, described by offset and limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRange {
    pub id: Uuid,
    pub entity_type: ReindexEntityType,
    pub limit: u32,
    pub offset: u32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<UploadRangeRow> for UploadRange {
    type Error = crate::error::ReindexError;

    fn try_from(row: UploadRangeRow) -> Result<Self, Self::Error> {
        Ok(UploadRange {
            id: row.id,
            entity_type: row.entity_type.parse()?,
            limit: u32::try_from(row.range_limit)?,
            offset: u32::try_from(row.range_offset)?,
            created_at: row.created_at,
            finished_at: row.finished_at,
        })
    }
}

impl TryFrom<&UploadRange> for UploadRangeRow {
    type Error = crate::error::ReindexError;

    fn try_from(range: &UploadRange) -> Result<Self, Self::Error> {
        Ok(UploadRangeRow {
            id: range.id,
            entity_type: range.entity_type.as_str().to_string(),
            range_limit: i32::try_from(range.limit)?,
            range_offset: i32::try_from(range.offset)?,
            created_at: range.created_at,
            finished_at: range.finished_at,
        })
    }
}

/// Where the documents of an upload range are read from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Instances joined with their holdings and items.
    Instances,
    SharedEntities(SharedEntityRepository),
}

/// Upload ranges and paged document reads of one entity type.
#[derive(Debug, Clone)]
pub struct UploadRangeRepository {
    pool: PgPool,
    schema: TenantSchema,
    entity_type: ReindexEntityType,
    source: UploadSource,
    range_size: u32,
}

impl UploadRangeRepository {
    pub fn for_instances(pool: PgPool, schema: TenantSchema, range_size: u32) -> Self {
        Self {
            pool,
            schema,
            entity_type: ReindexEntityType::Instance,
            source: UploadSource::Instances,
            range_size,
        }
    }

    pub fn for_shared_entities(
        pool: PgPool,
        schema: TenantSchema,
        repository: SharedEntityRepository,
        range_size: u32,
    ) -> Self {
        Self {
            pool,
            schema,
            entity_type: repository.sub_resource().entity_type(),
            source: UploadSource::SharedEntities(repository),
            range_size,
        }
    }

    pub fn entity_type(&self) -> ReindexEntityType {
        self.entity_type
    }

    /// Returns the persisted ranges. When there are none and `populate_if_not_exist` is set,
    /// `ceil(count / range_size)` ranges are created first.
    ///
    /// Range ids only depend on entity type and offset, so concurrent populations converge on
    /// the same rows.
    pub async fn get_upload_ranges(
        &self,
        populate_if_not_exist: bool,
    ) -> ReindexResult<Vec<UploadRange>> {
        let rows = db::get_upload_ranges(&self.pool, &self.schema, self.entity_type.as_str())
            .await?;
        if !rows.is_empty() || !populate_if_not_exist {
            return rows.into_iter().map(UploadRange::try_from).collect();
        }

        let count = self.count_entities().await?;
        let ranges = build_upload_ranges(self.entity_type, count, self.range_size)?;
        let rows = ranges
            .iter()
            .map(UploadRangeRow::try_from)
            .collect::<ReindexResult<Vec<_>>>()?;
        db::upsert_upload_ranges(&self.pool, &self.schema, &rows).await?;

        info!(
            entity_type = %self.entity_type,
            entities = count,
            ranges = ranges.len(),
            "populated upload ranges"
        );

        let rows = db::get_upload_ranges(&self.pool, &self.schema, self.entity_type.as_str())
            .await?;

        rows.into_iter().map(UploadRange::try_from).collect()
    }

    pub async fn count_entities(&self) -> ReindexResult<u64> {
        match &self.source {
            UploadSource::Instances => {
                let count = target_db::count_instances(&self.pool, &self.schema).await?;
                Ok(u64::try_from(count)?)
            }
            UploadSource::SharedEntities(repository) => repository.count_entities().await,
        }
    }

    /// Returns one index document per entity of the page, in id order.
    pub async fn fetch_by(&self, limit: u32, offset: u32) -> ReindexResult<Vec<Value>> {
        match &self.source {
            UploadSource::Instances => {
                let rows = target_db::fetch_instance_documents(
                    &self.pool,
                    &self.schema,
                    i64::from(limit),
                    i64::from(offset),
                )
                .await?;

                Ok(rows.into_iter().map(instance_document).collect())
            }
            UploadSource::SharedEntities(repository) => repository
                .fetch_by(limit, offset)
                .await?
                .iter()
                .map(|record| record.to_document())
                .collect(),
        }
    }

    pub async fn mark_range_finished(
        &self,
        id: Uuid,
        finished_at: DateTime<Utc>,
    ) -> ReindexResult<()> {
        let updated =
            db::update_upload_range_finished(&self.pool, &self.schema, id, finished_at).await?;
        if updated == 0 {
            bail!(ErrorKind::InvalidState, "Upload range does not exist", id);
        }

        debug!(entity_type = %self.entity_type, range_id = %id, "upload range finished");

        Ok(())
    }

    /// Removes the ranges of this entity type so the next population starts over.
    pub async fn truncate_upload_ranges(&self) -> ReindexResult<u64> {
        let deleted =
            db::delete_upload_ranges(&self.pool, &self.schema, self.entity_type.as_str()).await?;

        info!(entity_type = %self.entity_type, deleted, "truncated upload ranges");

        Ok(deleted)
    }
}

/// Merges an instance with its holdings and items into one document.
fn instance_document(row: InstanceDocumentRow) -> Value {
    let mut document = match row.instance {
        Value::Object(instance) => instance,
        _ => Map::new(),
    };

    document.insert("id".to_string(), Value::String(row.id.to_string()));
    document.insert("tenantId".to_string(), Value::String(row.tenant_id));
    document.insert("shared".to_string(), Value::Bool(row.shared));
    document.insert("isBoundWith".to_string(), Value::Bool(row.is_bound_with));
    document.insert("holdings".to_string(), row.holdings);
    document.insert("items".to_string(), row.items);

    Value::Object(document)
}
