use sqlx::{Executor, PgPool, Postgres, QueryBuilder, prelude::FromRow};
use uuid::Uuid;

use crate::schema::TenantSchema;

/// Consolidated tables written during the merge phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTargetTable {
    Instance,
    Holding,
    Item,
}

impl MergeTargetTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            Self::Instance => "instance",
            Self::Holding => "holding",
            Self::Item => "item",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub shared: bool,
    pub is_bound_with: bool,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HoldingRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub json: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub instance_id: Uuid,
    pub holding_id: Uuid,
    pub json: serde_json::Value,
}

/// An instance joined with its live holdings and items.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct InstanceDocumentRow {
    pub id: Uuid,
    pub tenant_id: String,
    pub shared: bool,
    pub is_bound_with: bool,
    pub instance: serde_json::Value,
    pub holdings: serde_json::Value,
    pub items: serde_json::Value,
}

pub fn build_instance_upsert(
    schema: &TenantSchema,
    rows: &[InstanceRow],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "insert into {} (id, tenant_id, shared, is_bound_with, json, is_deleted, last_updated_date) ",
        schema.table(MergeTargetTable::Instance.table_name())
    ));
    builder.push_values(rows, |mut row, instance| {
        row.push_bind(instance.id)
            .push_bind(instance.tenant_id.clone())
            .push_bind(instance.shared)
            .push_bind(instance.is_bound_with)
            .push_bind(instance.json.clone())
            .push("false")
            .push("now()");
    });
    builder.push(
        " on conflict (id) do update set tenant_id = excluded.tenant_id, shared = excluded.shared, \
         is_bound_with = excluded.is_bound_with, json = excluded.json, is_deleted = false, \
         last_updated_date = now()",
    );

    builder
}

pub fn build_holding_upsert(
    schema: &TenantSchema,
    rows: &[HoldingRow],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "insert into {} (id, tenant_id, instance_id, json, is_deleted, last_updated_date) ",
        schema.table(MergeTargetTable::Holding.table_name())
    ));
    builder.push_values(rows, |mut row, holding| {
        row.push_bind(holding.id)
            .push_bind(holding.tenant_id.clone())
            .push_bind(holding.instance_id)
            .push_bind(holding.json.clone())
            .push("false")
            .push("now()");
    });
    builder.push(
        " on conflict (id, tenant_id) do update set instance_id = excluded.instance_id, \
         json = excluded.json, is_deleted = false, last_updated_date = now()",
    );

    builder
}

pub fn build_item_upsert(
    schema: &TenantSchema,
    rows: &[ItemRow],
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "insert into {} (id, tenant_id, instance_id, holding_id, json, is_deleted, last_updated_date) ",
        schema.table(MergeTargetTable::Item.table_name())
    ));
    builder.push_values(rows, |mut row, item| {
        row.push_bind(item.id)
            .push_bind(item.tenant_id.clone())
            .push_bind(item.instance_id)
            .push_bind(item.holding_id)
            .push_bind(item.json.clone())
            .push("false")
            .push("now()");
    });
    builder.push(
        " on conflict (id, tenant_id) do update set instance_id = excluded.instance_id, \
         holding_id = excluded.holding_id, json = excluded.json, is_deleted = false, \
         last_updated_date = now()",
    );

    builder
}

/// Builds the removal of `ids` from `table`, optionally restricted to one tenant.
///
/// A soft delete flags the rows as deleted and bumps their `last_updated_date`, so incremental
/// consumers see the removal.
pub fn build_delete(
    schema: &TenantSchema,
    table: MergeTargetTable,
    ids: &[Uuid],
    tenant_id: Option<&str>,
    soft: bool,
) -> QueryBuilder<'static, Postgres> {
    let table = schema.table(table.table_name());
    let mut builder = if soft {
        QueryBuilder::new(format!(
            "update {table} set is_deleted = true, last_updated_date = now() where id = any("
        ))
    } else {
        QueryBuilder::new(format!("delete from {table} where id = any("))
    };
    builder.push_bind(ids.to_vec()).push(")");

    if let Some(tenant_id) = tenant_id {
        builder
            .push(" and tenant_id = ")
            .push_bind(tenant_id.to_string());
    }

    builder
}

pub async fn upsert_instances<'c, E>(
    executor: E,
    schema: &TenantSchema,
    rows: &[InstanceRow],
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = build_instance_upsert(schema, rows);
    let result = builder.build().execute(executor).await?;

    Ok(result.rows_affected())
}

pub async fn upsert_holdings<'c, E>(
    executor: E,
    schema: &TenantSchema,
    rows: &[HoldingRow],
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = build_holding_upsert(schema, rows);
    let result = builder.build().execute(executor).await?;

    Ok(result.rows_affected())
}

pub async fn upsert_items<'c, E>(
    executor: E,
    schema: &TenantSchema,
    rows: &[ItemRow],
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = build_item_upsert(schema, rows);
    let result = builder.build().execute(executor).await?;

    Ok(result.rows_affected())
}

/// Removes or flags `ids` in `table`. Returns the number of affected rows.
pub async fn delete_merge_entities(
    pool: &PgPool,
    schema: &TenantSchema,
    table: MergeTargetTable,
    ids: &[Uuid],
    tenant_id: Option<&str>,
    soft: bool,
) -> sqlx::Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut builder = build_delete(schema, table, ids, tenant_id, soft);
    let result = builder.build().execute(pool).await?;

    Ok(result.rows_affected())
}

/// Counts instances that are not flagged as deleted.
pub async fn count_instances(pool: &PgPool, schema: &TenantSchema) -> sqlx::Result<i64> {
    let query = format!(
        "select count(*) from {} where is_deleted = false",
        schema.table(MergeTargetTable::Instance.table_name())
    );

    sqlx::query_scalar::<_, i64>(&query).fetch_one(pool).await
}

/// Returns an id-ordered page of instances, each joined with its holdings and items.
pub async fn fetch_instance_documents(
    pool: &PgPool,
    schema: &TenantSchema,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<InstanceDocumentRow>> {
    let query = format!(
        r#"
        select i.id, i.tenant_id, i.shared, i.is_bound_with, i.json as instance,
               coalesce(h.holdings, '[]'::jsonb) as holdings,
               coalesce(it.items, '[]'::jsonb) as items
        from (
            select id, tenant_id, shared, is_bound_with, json
            from {instance}
            where is_deleted = false
            order by id
            limit $1 offset $2
        ) i
        left join lateral (
            select jsonb_agg(json order by id, tenant_id) as holdings
            from {holding}
            where instance_id = i.id and is_deleted = false
        ) h on true
        left join lateral (
            select jsonb_agg(json order by id, tenant_id) as items
            from {item}
            where instance_id = i.id and is_deleted = false
        ) it on true
        order by i.id
        "#,
        instance = schema.table(MergeTargetTable::Instance.table_name()),
        holding = schema.table(MergeTargetTable::Holding.table_name()),
        item = schema.table(MergeTargetTable::Item.table_name()),
    );

    sqlx::query_as::<_, InstanceDocumentRow>(&query)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> TenantSchema {
        TenantSchema::parse("cons_mod_search").unwrap()
    }

    #[test]
    fn instance_upsert_revives_soft_deleted_rows() {
        let rows = [InstanceRow {
            id: Uuid::nil(),
            tenant_id: "cons".to_string(),
            shared: true,
            is_bound_with: false,
            json: json!({"title": "t"}),
        }];
        let builder = build_instance_upsert(&schema(), &rows);

        assert!(
            builder
                .sql()
                .contains("VALUES ($1, $2, $3, $4, $5, false, now())")
        );
        assert!(builder.sql().contains("on conflict (id) do update"));
        assert!(builder.sql().contains("is_deleted = false"));
    }

    #[test]
    fn holdings_and_items_conflict_on_tenant_scoped_key() {
        let holdings = [HoldingRow {
            id: Uuid::nil(),
            tenant_id: "member".to_string(),
            instance_id: Uuid::nil(),
            json: json!({}),
        }];
        let items = [ItemRow {
            id: Uuid::nil(),
            tenant_id: "member".to_string(),
            instance_id: Uuid::nil(),
            holding_id: Uuid::nil(),
            json: json!({}),
        }];

        assert!(
            build_holding_upsert(&schema(), &holdings)
                .sql()
                .contains("on conflict (id, tenant_id)")
        );
        assert!(
            build_item_upsert(&schema(), &items)
                .sql()
                .contains("on conflict (id, tenant_id)")
        );
    }

    #[test]
    fn soft_delete_flags_rows_and_hard_delete_removes_them() {
        let ids = [Uuid::nil()];

        let soft = build_delete(&schema(), MergeTargetTable::Item, &ids, Some("member"), true);
        assert_eq!(
            soft.sql(),
            "update cons_mod_search.item set is_deleted = true, last_updated_date = now() \
             where id = any($1) and tenant_id = $2"
        );

        let hard = build_delete(&schema(), MergeTargetTable::Holding, &ids, None, false);
        assert_eq!(
            hard.sql(),
            "delete from cons_mod_search.holding where id = any($1)"
        );
    }
}
