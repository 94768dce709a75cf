//! Descriptor-driven SQL for the shared entity tables.
//!
//! Each shared entity type (classification, contributor, subject, call number) is described by a
//! [`SharedEntityDescriptor`]: its tables, the columns extracted from incoming records and the
//! capabilities of the type. Every statement here is built from a descriptor, so adding a type
//! means adding a table entry, not new SQL.

use chrono::{DateTime, Utc};
use pg_escape::quote_literal;
use sqlx::query_builder::Separated;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, prelude::FromRow};
use uuid::Uuid;

use crate::schema::TenantSchema;

/// Selects which set of tables a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    Main,
    Staging,
}

/// A column filled from a key of the incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name in the table.
    pub name: &'static str,
    /// Key of the value in the incoming record.
    pub key: &'static str,
    /// Cast applied to the bound text value, e.g. `::uuid`.
    pub cast: &'static str,
    /// Value used when the record has no value for `key`.
    pub default: Option<&'static str>,
}

impl ColumnSpec {
    const fn text(name: &'static str, key: &'static str) -> Self {
        Self {
            name,
            key,
            cast: "",
            default: None,
        }
    }

    const fn uuid(name: &'static str, key: &'static str) -> Self {
        Self {
            name,
            key,
            cast: "::uuid",
            default: None,
        }
    }

    const fn with_default(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingTables {
    pub entity_table: &'static str,
    pub relation_table: &'static str,
}

/// What a shared entity type supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityCapabilities {
    /// The type has staging tables for member tenant reindexes.
    pub has_staging: bool,
    /// Relationship deletes can be restricted to a single tenant.
    pub tenant_scoped_deletes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedEntityDescriptor {
    pub entity_type: &'static str,
    pub entity_table: &'static str,
    pub relation_table: &'static str,
    /// Column of the relationship table referencing the entity id.
    pub relation_entity_column: &'static str,
    /// Natural content columns of the entity, in natural key order.
    pub entity_columns: &'static [ColumnSpec],
    /// Relationship columns besides the entity id, `instance_id`, `tenant_id` and `shared`.
    pub relation_columns: &'static [ColumnSpec],
    pub staging: Option<StagingTables>,
    pub tenant_scoped_deletes: bool,
}

impl SharedEntityDescriptor {
    pub fn capabilities(&self) -> EntityCapabilities {
        EntityCapabilities {
            has_staging: self.staging.is_some(),
            tenant_scoped_deletes: self.tenant_scoped_deletes,
        }
    }

    /// Entity table written for `target`. Types without staging always use the main table.
    pub fn entity_table_for(&self, target: WriteTarget) -> &'static str {
        match (target, self.staging) {
            (WriteTarget::Staging, Some(staging)) => staging.entity_table,
            _ => self.entity_table,
        }
    }

    /// Relationship table written for `target`. Types without staging always use the main table.
    pub fn relation_table_for(&self, target: WriteTarget) -> &'static str {
        match (target, self.staging) {
            (WriteTarget::Staging, Some(staging)) => staging.relation_table,
            _ => self.relation_table,
        }
    }
}

pub const CLASSIFICATION: SharedEntityDescriptor = SharedEntityDescriptor {
    entity_type: "classification",
    entity_table: "classification",
    relation_table: "instance_classification",
    relation_entity_column: "classification_id",
    entity_columns: &[
        ColumnSpec::text("number", "number"),
        ColumnSpec::text("type_id", "typeId"),
    ],
    relation_columns: &[],
    staging: Some(StagingTables {
        entity_table: "staging_classification",
        relation_table: "staging_instance_classification",
    }),
    tenant_scoped_deletes: true,
};

pub const CONTRIBUTOR: SharedEntityDescriptor = SharedEntityDescriptor {
    entity_type: "contributor",
    entity_table: "contributor",
    relation_table: "instance_contributor",
    relation_entity_column: "contributor_id",
    entity_columns: &[
        ColumnSpec::text("name", "name"),
        ColumnSpec::text("name_type_id", "contributorNameTypeId"),
        ColumnSpec::text("authority_id", "authorityId"),
    ],
    relation_columns: &[ColumnSpec::text("type_id", "typeId").with_default("")],
    staging: Some(StagingTables {
        entity_table: "staging_contributor",
        relation_table: "staging_instance_contributor",
    }),
    tenant_scoped_deletes: true,
};

pub const SUBJECT: SharedEntityDescriptor = SharedEntityDescriptor {
    entity_type: "subject",
    entity_table: "subject",
    relation_table: "instance_subject",
    relation_entity_column: "subject_id",
    entity_columns: &[
        ColumnSpec::text("value", "value"),
        ColumnSpec::text("authority_id", "authorityId"),
        ColumnSpec::text("source_id", "sourceId"),
        ColumnSpec::text("type_id", "typeId"),
    ],
    relation_columns: &[],
    staging: Some(StagingTables {
        entity_table: "staging_subject",
        relation_table: "staging_instance_subject",
    }),
    tenant_scoped_deletes: true,
};

pub const CALL_NUMBER: SharedEntityDescriptor = SharedEntityDescriptor {
    entity_type: "call_number",
    entity_table: "call_number",
    relation_table: "instance_call_number",
    relation_entity_column: "call_number_id",
    entity_columns: &[
        ColumnSpec::text("call_number", "callNumber"),
        ColumnSpec::text("call_number_prefix", "callNumberPrefix"),
        ColumnSpec::text("call_number_suffix", "callNumberSuffix"),
        ColumnSpec::text("call_number_type_id", "callNumberTypeId"),
        ColumnSpec::text("volume", "volume"),
        ColumnSpec::text("enumeration", "enumeration"),
        ColumnSpec::text("chronology", "chronology"),
        ColumnSpec::text("copy_number", "copyNumber"),
    ],
    relation_columns: &[
        ColumnSpec::uuid("item_id", "itemId"),
        ColumnSpec::uuid("location_id", "locationId"),
    ],
    staging: None,
    tenant_scoped_deletes: true,
};

/// Every shared entity type, in a stable order.
pub const SHARED_ENTITY_DESCRIPTORS: [&SharedEntityDescriptor; 4] =
    [&CLASSIFICATION, &CONTRIBUTOR, &SUBJECT, &CALL_NUMBER];

/// Returns the descriptor registered for `entity_type`.
pub fn descriptor_for(entity_type: &str) -> Option<&'static SharedEntityDescriptor> {
    SHARED_ENTITY_DESCRIPTORS
        .into_iter()
        .find(|descriptor| descriptor.entity_type == entity_type)
}

/// An entity row ready to be written. `values` follow the descriptor's entity columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub id: String,
    pub values: Vec<Option<String>>,
}

/// A relationship row ready to be written. `values` follow the descriptor's relation columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRow {
    pub entity_id: String,
    /// Bound as text and cast, so malformed ids fail the statement instead of the caller.
    pub instance_id: String,
    pub tenant_id: String,
    pub shared: bool,
    pub values: Vec<Option<String>>,
}

/// A shared entity with its instance counts aggregated per tenant and shared flag.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct SharedEntityRecordRow {
    pub id: String,
    pub last_updated_date: DateTime<Utc>,
    /// Entity columns keyed by their record keys.
    pub fields: serde_json::Value,
    /// Array of `{count, shared, tenantId}` objects.
    pub instances: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PromotedRows {
    pub entities: u64,
    pub relations: u64,
}

fn push_column_value(
    row: &mut Separated<'_, 'static, Postgres, &'static str>,
    column: &ColumnSpec,
    value: Option<String>,
) {
    row.push_bind(value);
    row.push_unseparated(column.cast);
}

/// Builds the insert for `rows` into the entity table of `target`.
///
/// The main table bumps `last_updated_date` on conflict, staging keeps the first writer.
pub fn build_entity_insert(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    target: WriteTarget,
    rows: &[EntityRow],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "insert into {} (id",
        schema.table(descriptor.entity_table_for(target))
    ));
    for column in descriptor.entity_columns {
        builder.push(", ").push(column.name);
    }
    builder.push(", last_updated_date) ");

    builder.push_values(rows, |mut row, entity| {
        row.push_bind(entity.id.clone());
        for (column, value) in descriptor.entity_columns.iter().zip(&entity.values) {
            push_column_value(&mut row, column, value.clone());
        }
        row.push("now()");
    });

    match target {
        WriteTarget::Staging if descriptor.staging.is_some() => {
            builder.push(" on conflict (id) do nothing");
        }
        _ => {
            builder.push(" on conflict (id) do update set last_updated_date = now()");
        }
    }

    builder
}

/// Builds the insert for `rows` into the relationship table of `target`.
pub fn build_relation_insert(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    target: WriteTarget,
    rows: &[RelationRow],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "insert into {} ({}, instance_id, tenant_id, shared",
        schema.table(descriptor.relation_table_for(target)),
        descriptor.relation_entity_column
    ));
    for column in descriptor.relation_columns {
        builder.push(", ").push(column.name);
    }
    builder.push(") ");

    builder.push_values(rows, |mut row, relation| {
        row.push_bind(relation.entity_id.clone());
        row.push_bind(relation.instance_id.clone());
        row.push_unseparated("::uuid");
        row.push_bind(relation.tenant_id.clone());
        row.push_bind(relation.shared);
        for (column, value) in descriptor.relation_columns.iter().zip(&relation.values) {
            push_column_value(&mut row, column, value.clone());
        }
    });
    builder.push(" on conflict do nothing");

    builder
}

/// Builds the statement removing relationship rows of `instance_ids` and bumping
/// `last_updated_date` of every entity that lost one. Entities are never deleted.
pub fn build_delete_by_instance_ids(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    instance_ids: &[Uuid],
    tenant_id: Option<&str>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "with deleted as (delete from {} where instance_id = any(",
        schema.table(descriptor.relation_table)
    ));
    builder.push_bind(instance_ids.to_vec());
    builder.push(")");

    if let Some(tenant_id) = tenant_id.filter(|_| descriptor.tenant_scoped_deletes) {
        builder.push(" and tenant_id = ").push_bind(tenant_id.to_string());
    }

    builder.push(format!(
        " returning {column}) update {table} set last_updated_date = now() \
         where id in (select {column} from deleted)",
        column = descriptor.relation_entity_column,
        table = schema.table(descriptor.entity_table),
    ));

    builder
}

/// Deletes the main relationship rows of every tenant present in staging and bumps
/// `last_updated_date` of each main entity that lost one, so the timestamp cursor revisits it.
pub fn build_clear_staged_tenants(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    staging: &StagingTables,
) -> String {
    format!(
        "with deleted as (delete from {main_relations} \
         where tenant_id in (select distinct tenant_id from {staging_relations}) \
         returning {column}) \
         update {main_entities} set last_updated_date = now() \
         where id in (select {column} from deleted)",
        main_relations = schema.table(descriptor.relation_table),
        staging_relations = schema.table(staging.relation_table),
        main_entities = schema.table(descriptor.entity_table),
        column = descriptor.relation_entity_column,
    )
}

fn push_fields_object(
    builder: &mut QueryBuilder<'static, Postgres>,
    descriptor: &SharedEntityDescriptor,
    alias: &str,
) {
    builder.push("jsonb_build_object(");
    for (i, column) in descriptor.entity_columns.iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(format!(
            "{}, {alias}.{}",
            quote_literal(column.key),
            column.name
        ));
    }
    builder.push(")");
}

/// Pushes a subquery yielding `(entity_id, instances)`, where `instances` aggregates the distinct
/// instance count per tenant and shared flag. `filter` restricts the relationship rows.
fn push_counts_subquery(
    builder: &mut QueryBuilder<'static, Postgres>,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    filter: impl FnOnce(&mut QueryBuilder<'static, Postgres>),
) {
    let column = descriptor.relation_entity_column;
    builder.push(format!(
        "select grouped.entity_id, \
         jsonb_agg(jsonb_build_object('count', grouped.instance_count, 'shared', grouped.shared, \
         'tenantId', grouped.tenant_id) order by grouped.tenant_id, grouped.shared) as instances \
         from (select {column} as entity_id, tenant_id, shared, \
         count(distinct instance_id) as instance_count from {} where ",
        schema.table(descriptor.relation_table)
    ));
    filter(builder);
    builder.push(format!(
        " group by {column}, tenant_id, shared) grouped group by grouped.entity_id"
    ));
}

/// Builds the aggregate fetch for entities with ids in `[lower, upper]`. Entities without any
/// relationship row are skipped.
pub fn build_fetch_by_id_range(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    lower: &str,
    upper: &str,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("select e.id, e.last_updated_date, ");
    push_fields_object(&mut builder, descriptor, "e");
    builder.push(" as fields, c.instances from (");

    let column = descriptor.relation_entity_column;
    let (lower, upper) = (lower.to_string(), upper.to_string());
    push_counts_subquery(&mut builder, schema, descriptor, |builder| {
        builder
            .push(format!("{column} >= "))
            .push_bind(lower)
            .push(format!(" and {column} <= "))
            .push_bind(upper);
    });

    builder.push(format!(
        ") c join {} e on e.id = c.entity_id order by e.id",
        schema.table(descriptor.entity_table)
    ));

    builder
}

/// Builds the cursor fetch of entities updated after `timestamp`, or after
/// `(timestamp, from_id)` when continuing a page, ordered by `(last_updated_date, id)`.
pub fn build_fetch_by_timestamp(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    timestamp: DateTime<Utc>,
    from_id: Option<&str>,
    limit: i64,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "with page as (select * from {} where ",
        schema.table(descriptor.entity_table)
    ));
    match from_id {
        Some(from_id) => {
            builder
                .push("(last_updated_date, id) > (")
                .push_bind(timestamp)
                .push(", ")
                .push_bind(from_id.to_string())
                .push(")");
        }
        None => {
            builder.push("last_updated_date > ").push_bind(timestamp);
        }
    }
    builder
        .push(" order by last_updated_date, id limit ")
        .push_bind(limit);

    builder.push("), counts as (");
    let column = descriptor.relation_entity_column;
    push_counts_subquery(&mut builder, schema, descriptor, |builder| {
        builder.push(format!("{column} in (select id from page)"));
    });

    builder.push(") select p.id, p.last_updated_date, ");
    push_fields_object(&mut builder, descriptor, "p");
    builder.push(
        " as fields, coalesce(c.instances, '[]'::jsonb) as instances \
         from page p left join counts c on c.entity_id = p.id \
         order by p.last_updated_date, p.id",
    );

    builder
}

/// Builds an id-ordered page of entities for the upload phase.
pub fn build_fetch_page(
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    limit: i64,
    offset: i64,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "with page as (select * from {} order by id limit ",
        schema.table(descriptor.entity_table)
    ));
    builder
        .push_bind(limit)
        .push(" offset ")
        .push_bind(offset);

    builder.push("), counts as (");
    let column = descriptor.relation_entity_column;
    push_counts_subquery(&mut builder, schema, descriptor, |builder| {
        builder.push(format!("{column} in (select id from page)"));
    });

    builder.push(") select p.id, p.last_updated_date, ");
    push_fields_object(&mut builder, descriptor, "p");
    builder.push(
        " as fields, coalesce(c.instances, '[]'::jsonb) as instances \
         from page p left join counts c on c.entity_id = p.id order by p.id",
    );

    builder
}

/// Writes entity rows. Returns the number of affected rows.
pub async fn insert_entities<'c, E>(
    executor: E,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    target: WriteTarget,
    rows: &[EntityRow],
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = build_entity_insert(schema, descriptor, target, rows);
    let result = builder.build().execute(executor).await?;

    Ok(result.rows_affected())
}

/// Writes relationship rows. Returns the number of inserted rows.
pub async fn insert_relations<'c, E>(
    executor: E,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    target: WriteTarget,
    rows: &[RelationRow],
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = build_relation_insert(schema, descriptor, target, rows);
    let result = builder.build().execute(executor).await?;

    Ok(result.rows_affected())
}

/// Deletes the relationship rows of `instance_ids`. Returns the number of entities whose
/// `last_updated_date` was bumped.
pub async fn delete_by_instance_ids(
    pool: &PgPool,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    instance_ids: &[Uuid],
    tenant_id: Option<&str>,
) -> sqlx::Result<u64> {
    if instance_ids.is_empty() {
        return Ok(0);
    }

    let mut builder = build_delete_by_instance_ids(schema, descriptor, instance_ids, tenant_id);
    let result = builder.build().execute(pool).await?;

    Ok(result.rows_affected())
}

pub async fn fetch_by_id_range(
    pool: &PgPool,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    lower: &str,
    upper: &str,
) -> sqlx::Result<Vec<SharedEntityRecordRow>> {
    let mut builder = build_fetch_by_id_range(schema, descriptor, lower, upper);

    builder
        .build_query_as::<SharedEntityRecordRow>()
        .fetch_all(pool)
        .await
}

pub async fn fetch_by_timestamp(
    pool: &PgPool,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    timestamp: DateTime<Utc>,
    from_id: Option<&str>,
    limit: i64,
) -> sqlx::Result<Vec<SharedEntityRecordRow>> {
    let mut builder = build_fetch_by_timestamp(schema, descriptor, timestamp, from_id, limit);

    builder
        .build_query_as::<SharedEntityRecordRow>()
        .fetch_all(pool)
        .await
}

pub async fn fetch_page(
    pool: &PgPool,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<SharedEntityRecordRow>> {
    let mut builder = build_fetch_page(schema, descriptor, limit, offset);

    builder
        .build_query_as::<SharedEntityRecordRow>()
        .fetch_all(pool)
        .await
}

pub async fn count_entities(
    pool: &PgPool,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
) -> sqlx::Result<i64> {
    let query = format!(
        "select count(*) from {}",
        schema.table(descriptor.entity_table)
    );

    sqlx::query_scalar::<_, i64>(&query).fetch_one(pool).await
}

/// Moves the staging rows of `descriptor` into the main tables and clears staging.
///
/// Main relationship rows of every tenant present in staging are replaced by the staged ones.
/// Runs in a single transaction.
pub async fn promote_staging(
    pool: &PgPool,
    schema: &TenantSchema,
    descriptor: &SharedEntityDescriptor,
) -> sqlx::Result<PromotedRows> {
    let Some(staging) = descriptor.staging else {
        return Ok(PromotedRows::default());
    };

    let entity_columns = descriptor
        .entity_columns
        .iter()
        .map(|column| column.name)
        .collect::<Vec<_>>()
        .join(", ");
    let mut relation_columns = vec![
        descriptor.relation_entity_column,
        "instance_id",
        "tenant_id",
        "shared",
    ];
    relation_columns.extend(descriptor.relation_columns.iter().map(|column| column.name));
    let relation_columns = relation_columns.join(", ");

    let main_entities = schema.table(descriptor.entity_table);
    let main_relations = schema.table(descriptor.relation_table);
    let staging_entities = schema.table(staging.entity_table);
    let staging_relations = schema.table(staging.relation_table);

    let mut tx = pool.begin().await?;

    let entities = sqlx::query(&format!(
        r#"
        insert into {main_entities} (id, {entity_columns}, last_updated_date)
        select id, {entity_columns}, now() from {staging_entities}
        on conflict (id) do update set last_updated_date = now()
        "#
    ))
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query(&build_clear_staged_tenants(schema, descriptor, &staging))
        .execute(&mut *tx)
        .await?;

    let relations = sqlx::query(&format!(
        r#"
        insert into {main_relations} ({relation_columns})
        select {relation_columns} from {staging_relations}
        on conflict do nothing
        "#
    ))
    .execute(&mut *tx)
    .await?
    .rows_affected();

    sqlx::query(&format!(
        "truncate table {staging_entities}, {staging_relations}"
    ))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(PromotedRows {
        entities,
        relations,
    })
}
