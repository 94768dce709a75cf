//! Conversion of raw inventory records into merge target rows and their batch sinks.

use postgres::reindex::merge_target::{
    self as db, HoldingRow, InstanceRow, ItemRow, MergeTargetTable,
};
use postgres::schema::TenantSchema;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::batch::BatchSink;
use crate::error::{ErrorKind, ReindexResult};
use crate::store::shared_entity::RawRecord;
use crate::types::ReindexEntityType;
use crate::{bail, reindex_error};

/// Returns the consolidated table of a merge target entity type.
pub fn merge_target_table(entity_type: ReindexEntityType) -> ReindexResult<MergeTargetTable> {
    match entity_type {
        ReindexEntityType::Instance => Ok(MergeTargetTable::Instance),
        ReindexEntityType::Holding => Ok(MergeTargetTable::Holding),
        ReindexEntityType::Item => Ok(MergeTargetTable::Item),
        other => bail!(
            ErrorKind::InvalidData,
            "Entity type is not a merge target",
            other
        ),
    }
}

pub fn instance_row(
    record: &RawRecord,
    tenant_id: &str,
    shared: bool,
) -> ReindexResult<InstanceRow> {
    let is_bound_with = match record.get("isBoundWith") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(other) => bail!(
            ErrorKind::InvalidData,
            "Bound-with flag is not a boolean",
            other
        ),
    };

    Ok(InstanceRow {
        id: uuid_field(record, "id")?,
        tenant_id: tenant_id.to_string(),
        shared,
        is_bound_with,
        json: Value::Object(record.clone()),
    })
}

pub fn holding_row(record: &RawRecord, tenant_id: &str) -> ReindexResult<HoldingRow> {
    Ok(HoldingRow {
        id: uuid_field(record, "id")?,
        tenant_id: tenant_id.to_string(),
        instance_id: uuid_field(record, "instanceId")?,
        json: Value::Object(record.clone()),
    })
}

pub fn item_row(record: &RawRecord, tenant_id: &str) -> ReindexResult<ItemRow> {
    Ok(ItemRow {
        id: uuid_field(record, "id")?,
        tenant_id: tenant_id.to_string(),
        instance_id: uuid_field(record, "instanceId")?,
        holding_id: uuid_field(record, "holdingsRecordId")?,
        json: Value::Object(record.clone()),
    })
}

fn uuid_field(record: &RawRecord, key: &'static str) -> ReindexResult<Uuid> {
    let Some(value) = record.get(key).and_then(Value::as_str) else {
        bail!(
            ErrorKind::InvalidData,
            "Record field is missing or not a string",
            key
        );
    };

    Uuid::parse_str(value).map_err(|err| {
        reindex_error!(
            ErrorKind::ConversionError,
            "Record field is not a uuid",
            detail = format!("{key}: {value}"),
            source: err
        )
    })
}

/// Upserts merge target rows into the tables of one schema.
pub(crate) struct MergeTargetSink<'a> {
    pub(crate) pool: &'a PgPool,
    pub(crate) schema: &'a TenantSchema,
}

impl BatchSink<InstanceRow> for MergeTargetSink<'_> {
    fn name(&self) -> &'static str {
        "instance_upsert"
    }

    async fn write_batch(&self, rows: &[InstanceRow]) -> ReindexResult<()> {
        db::upsert_instances(self.pool, self.schema, rows).await?;

        Ok(())
    }
}

impl BatchSink<HoldingRow> for MergeTargetSink<'_> {
    fn name(&self) -> &'static str {
        "holding_upsert"
    }

    async fn write_batch(&self, rows: &[HoldingRow]) -> ReindexResult<()> {
        db::upsert_holdings(self.pool, self.schema, rows).await?;

        Ok(())
    }
}

impl BatchSink<ItemRow> for MergeTargetSink<'_> {
    fn name(&self) -> &'static str {
        "item_upsert"
    }

    async fn write_batch(&self, rows: &[ItemRow]) -> ReindexResult<()> {
        db::upsert_items(self.pool, self.schema, rows).await?;

        Ok(())
    }
}
