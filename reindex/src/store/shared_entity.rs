use std::collections::HashSet;
use std::future::Future;

use chrono::{DateTime, Utc};
use postgres::reindex::shared_entity::{
    self as db, EntityRow, PromotedRows, RelationRow, SharedEntityDescriptor,
    SharedEntityRecordRow,
};
use postgres::schema::{SchemaResolver, TenantSchema};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::batch::{BatchSink, BatchWriteOutcome, RowError, write_chunked};
use crate::error::{ErrorKind, ReindexResult};
use crate::types::{EntityCapabilities, SubResourceType, WriteTarget};
use crate::{bail, reindex_error};

/// An incoming record as delivered by the upstream record source.
pub type RawRecord = Map<String, Value>;

/// Distinct instance count of a shared entity for one tenant and visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceCount {
    pub count: i64,
    pub shared: bool,
    pub tenant_id: String,
}

/// A shared entity with its per tenant instance counts.
#[derive(Debug, Clone, PartialEq)]
pub struct SharedEntityRecord {
    pub id: String,
    pub last_updated_date: DateTime<Utc>,
    /// Natural content of the entity keyed by record keys.
    pub fields: Value,
    pub instances: Vec<InstanceCount>,
}

impl SharedEntityRecord {
    /// Returns the record as a single JSON document for the index writer.
    pub fn to_document(&self) -> ReindexResult<Value> {
        let mut document = match &self.fields {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        document.insert("id".to_string(), Value::String(self.id.clone()));
        document.insert("instances".to_string(), serde_json::to_value(&self.instances)?);

        Ok(Value::Object(document))
    }
}

impl TryFrom<SharedEntityRecordRow> for SharedEntityRecord {
    type Error = crate::error::ReindexError;

    fn try_from(row: SharedEntityRecordRow) -> Result<Self, Self::Error> {
        Ok(SharedEntityRecord {
            id: row.id,
            last_updated_date: row.last_updated_date,
            fields: row.fields,
            instances: serde_json::from_value(row.instances)?,
        })
    }
}

/// A page of a timestamp cursor fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimestampPage {
    pub records: Vec<SharedEntityRecord>,
    /// Largest `last_updated_date` of the page, `None` when the page is empty.
    pub max_timestamp: Option<DateTime<Utc>>,
}

/// Outcome of [`SharedEntityRepository::save_all`].
#[derive(Debug, Clone, Default)]
pub struct SaveAllOutcome {
    /// Records that could not be turned into rows. Indexes refer to the input records.
    pub rejected: Vec<RowError>,
    /// Entity writes. Indexes refer to the entities after de-duplication.
    pub entities: BatchWriteOutcome,
    /// Relationship writes. Indexes refer to the relationship rows of accepted records.
    pub relations: BatchWriteOutcome,
}

impl SaveAllOutcome {
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty() && self.entities.is_complete() && self.relations.is_complete()
    }
}

/// Timestamp cursor access used by the sub-resources pass.
pub trait SubResourceSource {
    fn sub_resource(&self) -> SubResourceType;

    /// Returns the entities of `tenant_id` updated after `timestamp`, or after
    /// `(timestamp, from_id)`, ordered by `(last_updated_date, id)`.
    fn fetch_by_timestamp(
        &self,
        tenant_id: &str,
        timestamp: DateTime<Utc>,
        from_id: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = ReindexResult<TimestampPage>> + Send;
}

/// Repository of one shared entity type, driven by its descriptor.
///
/// Writes, deletes and range fetches work on the schema the repository is bound to. Timestamp
/// fetches resolve the schema of the requested tenant.
#[derive(Debug, Clone)]
pub struct SharedEntityRepository {
    pool: PgPool,
    schema: TenantSchema,
    resolver: SchemaResolver,
    sub_resource: SubResourceType,
    batch_size: usize,
}

impl SharedEntityRepository {
    pub fn new(
        pool: PgPool,
        schema: TenantSchema,
        resolver: SchemaResolver,
        sub_resource: SubResourceType,
        batch_size: usize,
    ) -> Self {
        Self {
            pool,
            schema,
            resolver,
            sub_resource,
            batch_size,
        }
    }

    fn descriptor(&self) -> &'static SharedEntityDescriptor {
        self.sub_resource.descriptor()
    }

    pub fn sub_resource(&self) -> SubResourceType {
        self.sub_resource
    }

    pub fn capabilities(&self) -> EntityCapabilities {
        self.sub_resource.capabilities()
    }

    pub fn supports_tenant_specific_deletion(&self) -> bool {
        self.capabilities().tenant_scoped_deletes
    }

    /// Splits `records` into entity and relationship rows and writes both to `target`.
    ///
    /// Rows are written in batches with a row by row fallback, so malformed rows are reported in
    /// the outcome and never fail the call.
    pub async fn save_all(&self, records: &[RawRecord], target: WriteTarget) -> SaveAllOutcome {
        let target = self.effective_target(target);
        let descriptor = self.descriptor();

        let mut outcome = SaveAllOutcome::default();
        let mut entities = Vec::new();
        let mut relations = Vec::with_capacity(records.len());
        let mut seen_ids = HashSet::new();

        for (index, record) in records.iter().enumerate() {
            match split_record(descriptor, record) {
                Ok((entity, relation)) => {
                    // One upsert statement cannot touch the same row twice.
                    if seen_ids.insert(entity.id.clone()) {
                        entities.push(entity);
                    }
                    relations.push(relation);
                }
                Err(error) => outcome.rejected.push(RowError { index, error }),
            }
        }

        let entity_sink = EntitySink {
            repository: self,
            target,
        };
        outcome.entities = write_chunked(&entity_sink, &entities, self.batch_size).await;

        let relation_sink = RelationSink {
            repository: self,
            target,
        };
        outcome.relations = write_chunked(&relation_sink, &relations, self.batch_size).await;

        debug!(
            entity_type = %self.sub_resource,
            schema = %self.schema,
            ?target,
            records = records.len(),
            rejected = outcome.rejected.len(),
            entities = outcome.entities.succeeded,
            relations = outcome.relations.succeeded,
            "saved shared entities"
        );

        outcome
    }

    /// Removes the relationship rows of `instance_ids` and bumps `last_updated_date` of every
    /// entity that lost one. Entities left without relationships are kept.
    ///
    /// `tenant_id` restricts the removal to one tenant when the type supports it.
    pub async fn delete_by_instance_ids(
        &self,
        instance_ids: &[Uuid],
        tenant_id: Option<&str>,
    ) -> ReindexResult<u64> {
        if tenant_id.is_some() && !self.supports_tenant_specific_deletion() {
            debug!(
                entity_type = %self.sub_resource,
                "type has no tenant scoped deletes, deleting for all tenants"
            );
        }

        let bumped = db::delete_by_instance_ids(
            &self.pool,
            &self.schema,
            self.descriptor(),
            instance_ids,
            tenant_id,
        )
        .await?;

        debug!(
            entity_type = %self.sub_resource,
            instances = instance_ids.len(),
            bumped,
            "deleted shared entity relationships"
        );

        Ok(bumped)
    }

    /// Returns the entities with ids in `[lower, upper]` that have at least one relationship.
    pub async fn fetch_by_id_range(
        &self,
        lower: &str,
        upper: &str,
    ) -> ReindexResult<Vec<SharedEntityRecord>> {
        let rows =
            db::fetch_by_id_range(&self.pool, &self.schema, self.descriptor(), lower, upper)
                .await?;

        rows.into_iter().map(SharedEntityRecord::try_from).collect()
    }

    pub async fn fetch_by_timestamp(
        &self,
        tenant_id: &str,
        timestamp: DateTime<Utc>,
        from_id: Option<&str>,
        limit: u32,
    ) -> ReindexResult<TimestampPage> {
        let schema = self.resolver.schema_for(tenant_id)?;
        let rows = db::fetch_by_timestamp(
            &self.pool,
            &schema,
            self.descriptor(),
            timestamp,
            from_id,
            i64::from(limit),
        )
        .await?;

        let records = rows
            .into_iter()
            .map(SharedEntityRecord::try_from)
            .collect::<ReindexResult<Vec<_>>>()?;
        let max_timestamp = records.iter().map(|record| record.last_updated_date).max();

        Ok(TimestampPage {
            records,
            max_timestamp,
        })
    }

    pub async fn count_entities(&self) -> ReindexResult<u64> {
        let count = db::count_entities(&self.pool, &self.schema, self.descriptor()).await?;

        Ok(u64::try_from(count)?)
    }

    /// Returns an id-ordered page of entities for the upload phase.
    pub async fn fetch_by(
        &self,
        limit: u32,
        offset: u32,
    ) -> ReindexResult<Vec<SharedEntityRecord>> {
        let rows = db::fetch_page(
            &self.pool,
            &self.schema,
            self.descriptor(),
            i64::from(limit),
            i64::from(offset),
        )
        .await?;

        rows.into_iter().map(SharedEntityRecord::try_from).collect()
    }

    /// Moves the staging rows into the main tables and clears staging.
    pub async fn promote_staging(&self) -> ReindexResult<PromotedRows> {
        if !self.capabilities().has_staging {
            bail!(
                ErrorKind::InvalidState,
                "Entity type has no staging tables",
                self.sub_resource.to_string()
            );
        }

        let promoted = db::promote_staging(&self.pool, &self.schema, self.descriptor()).await?;

        info!(
            entity_type = %self.sub_resource,
            schema = %self.schema,
            entities = promoted.entities,
            relations = promoted.relations,
            "promoted staging rows"
        );

        Ok(promoted)
    }

    fn effective_target(&self, target: WriteTarget) -> WriteTarget {
        if target == WriteTarget::Staging && !self.capabilities().has_staging {
            debug!(
                entity_type = %self.sub_resource,
                "type has no staging tables, writing to main tables"
            );
            return WriteTarget::Main;
        }

        target
    }
}

impl SubResourceSource for SharedEntityRepository {
    fn sub_resource(&self) -> SubResourceType {
        self.sub_resource
    }

    async fn fetch_by_timestamp(
        &self,
        tenant_id: &str,
        timestamp: DateTime<Utc>,
        from_id: Option<&str>,
        limit: u32,
    ) -> ReindexResult<TimestampPage> {
        SharedEntityRepository::fetch_by_timestamp(self, tenant_id, timestamp, from_id, limit).await
    }
}

struct EntitySink<'a> {
    repository: &'a SharedEntityRepository,
    target: WriteTarget,
}

impl BatchSink<EntityRow> for EntitySink<'_> {
    fn name(&self) -> &'static str {
        "shared_entity_insert"
    }

    async fn write_batch(&self, rows: &[EntityRow]) -> ReindexResult<()> {
        db::insert_entities(
            &self.repository.pool,
            &self.repository.schema,
            self.repository.descriptor(),
            self.target,
            rows,
        )
        .await?;

        Ok(())
    }
}

struct RelationSink<'a> {
    repository: &'a SharedEntityRepository,
    target: WriteTarget,
}

impl BatchSink<RelationRow> for RelationSink<'_> {
    fn name(&self) -> &'static str {
        "shared_entity_relation_insert"
    }

    async fn write_batch(&self, rows: &[RelationRow]) -> ReindexResult<()> {
        db::insert_relations(
            &self.repository.pool,
            &self.repository.schema,
            self.repository.descriptor(),
            self.target,
            rows,
        )
        .await?;

        Ok(())
    }
}

/// Renders a JSON value as the text bound for a column. `null` becomes SQL `NULL`.
fn value_as_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(value) => Some(value.clone()),
        other => Some(other.to_string()),
    }
}

/// Hex SHA-256 of the natural key values joined with `|`.
fn natural_key_id(values: &[Option<String>]) -> String {
    let joined = values
        .iter()
        .map(|value| value.as_deref().unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|");

    hex::encode(Sha256::digest(joined.as_bytes()))
}

/// Extracts the entity and relationship rows of one record.
fn split_record(
    descriptor: &SharedEntityDescriptor,
    record: &RawRecord,
) -> ReindexResult<(EntityRow, RelationRow)> {
    let values = descriptor
        .entity_columns
        .iter()
        .map(|column| value_as_text(record.get(column.key)))
        .collect::<Vec<_>>();
    let id = value_as_text(record.get("id")).unwrap_or_else(|| natural_key_id(&values));

    let Some(instance_id) = value_as_text(record.get("instanceId")) else {
        bail!(
            ErrorKind::InvalidData,
            "Shared entity record has no instance id",
            detail = format!("{} {id}", descriptor.entity_type)
        );
    };
    let Some(tenant_id) = value_as_text(record.get("tenantId")) else {
        bail!(
            ErrorKind::InvalidData,
            "Shared entity record has no tenant id",
            detail = format!("{} {id}", descriptor.entity_type)
        );
    };
    let shared = match record.get("shared") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(shared)) => *shared,
        Some(other) => {
            return Err(reindex_error!(
                ErrorKind::InvalidData,
                "Shared flag is not a boolean",
                other
            ));
        }
    };

    let relation_values = descriptor
        .relation_columns
        .iter()
        .map(|column| {
            value_as_text(record.get(column.key))
                .or_else(|| column.default.map(ToString::to_string))
        })
        .collect();

    Ok((
        EntityRow {
            id: id.clone(),
            values,
        },
        RelationRow {
            entity_id: id,
            instance_id,
            tenant_id,
            shared,
            values: relation_values,
        },
    ))
}

#[cfg(test)]
mod tests {
    use postgres::reindex::shared_entity::{CLASSIFICATION, CONTRIBUTOR};
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("record must be an object"),
        }
    }

    #[test]
    fn missing_id_is_derived_from_natural_key() {
        let first = record(json!({
            "number": "QA76.73",
            "typeId": "lc",
            "instanceId": Uuid::nil().to_string(),
            "tenantId": "diku",
        }));
        let second = record(json!({
            "number": "QA76.73",
            "typeId": "lc",
            "instanceId": Uuid::from_u128(1).to_string(),
            "tenantId": "college",
            "shared": true,
        }));

        let (entity_a, relation_a) = split_record(&CLASSIFICATION, &first).unwrap();
        let (entity_b, relation_b) = split_record(&CLASSIFICATION, &second).unwrap();

        assert_eq!(entity_a.id, entity_b.id);
        assert_eq!(entity_a.id.len(), 64);
        assert_eq!(
            entity_a.values,
            vec![Some("QA76.73".to_string()), Some("lc".to_string())]
        );
        assert!(!relation_a.shared);
        assert!(relation_b.shared);
        assert_eq!(relation_b.tenant_id, "college");
    }

    #[test]
    fn explicit_id_wins_over_natural_key() {
        let input = record(json!({
            "id": "abc",
            "number": "QA76",
            "instanceId": Uuid::nil().to_string(),
            "tenantId": "diku",
        }));

        let (entity, relation) = split_record(&CLASSIFICATION, &input).unwrap();

        assert_eq!(entity.id, "abc");
        assert_eq!(relation.entity_id, "abc");
        assert_eq!(entity.values[1], None);
    }

    #[test]
    fn relation_defaults_fill_missing_values() {
        let input = record(json!({
            "name": "Knuth, Donald",
            "instanceId": Uuid::nil().to_string(),
            "tenantId": "diku",
        }));

        let (_, relation) = split_record(&CONTRIBUTOR, &input).unwrap();

        assert_eq!(relation.values, vec![Some(String::new())]);
    }

    #[test]
    fn records_without_tenant_are_rejected() {
        let input = record(json!({
            "number": "QA76",
            "instanceId": Uuid::nil().to_string(),
        }));

        let err = split_record(&CLASSIFICATION, &input).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.description(), Some("Shared entity record has no tenant id"));
    }

    #[test]
    fn documents_carry_id_fields_and_counts() {
        let entity = SharedEntityRecord {
            id: "abc".to_string(),
            last_updated_date: Utc::now(),
            fields: json!({"number": "QA76", "typeId": null}),
            instances: vec![InstanceCount {
                count: 2,
                shared: false,
                tenant_id: "diku".to_string(),
            }],
        };

        assert_eq!(
            entity.to_document().unwrap(),
            json!({
                "id": "abc",
                "number": "QA76",
                "typeId": null,
                "instances": [{"count": 2, "shared": false, "tenantId": "diku"}],
            })
        );
    }
}
