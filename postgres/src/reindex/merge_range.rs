use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, prelude::FromRow};
use uuid::Uuid;

use crate::reindex::rows_per_statement;
use crate::schema::TenantSchema;

const MERGE_RANGE_TABLE: &str = "merge_range";

/// A row from the `merge_range` table.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct MergeRangeRow {
    pub id: Uuid,
    pub entity_type: String,
    pub tenant_id: String,
    pub lower: Uuid,
    pub upper: Uuid,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub fail_cause: Option<String>,
}

/// Number of bound columns per merge range row.
const MERGE_RANGE_COLUMNS: usize = 9;

/// Inserts `ranges` inside one transaction, split into statements that stay under the bind
/// parameter limit.
pub async fn insert_merge_ranges(
    pool: &PgPool,
    schema: &TenantSchema,
    ranges: &[MergeRangeRow],
) -> sqlx::Result<()> {
    if ranges.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;

    for chunk in ranges.chunks(rows_per_statement(MERGE_RANGE_COLUMNS)) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "insert into {} (id, entity_type, tenant_id, lower, upper, created_at, finished_at, status, fail_cause) ",
            schema.table(MERGE_RANGE_TABLE)
        ));
        builder.push_values(chunk, |mut row, range| {
            row.push_bind(range.id)
                .push_bind(range.entity_type.clone())
                .push_bind(range.tenant_id.clone())
                .push_bind(range.lower)
                .push_bind(range.upper)
                .push_bind(range.created_at)
                .push_bind(range.finished_at)
                .push_bind(range.status.clone())
                .push_bind(range.fail_cause.clone());
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Returns all ranges of `entity_type`, ordered by tenant and lower bound.
pub async fn get_merge_ranges(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
) -> sqlx::Result<Vec<MergeRangeRow>> {
    let query = format!(
        r#"
        select id, entity_type, tenant_id, lower, upper, created_at, finished_at, status, fail_cause
        from {}
        where entity_type = $1
        order by tenant_id, lower
        "#,
        schema.table(MERGE_RANGE_TABLE)
    );

    sqlx::query_as::<_, MergeRangeRow>(&query)
        .bind(entity_type)
        .fetch_all(pool)
        .await
}

/// Returns the ranges of `entity_type` currently in `status`.
pub async fn get_merge_ranges_with_status(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    status: &str,
) -> sqlx::Result<Vec<MergeRangeRow>> {
    let query = format!(
        r#"
        select id, entity_type, tenant_id, lower, upper, created_at, finished_at, status, fail_cause
        from {}
        where entity_type = $1 and status = $2
        order by tenant_id, lower
        "#,
        schema.table(MERGE_RANGE_TABLE)
    );

    sqlx::query_as::<_, MergeRangeRow>(&query)
        .bind(entity_type)
        .bind(status)
        .fetch_all(pool)
        .await
}

/// Updates status, finish time and failure cause of a range. Returns the number of updated rows.
pub async fn update_merge_range_status<'c, E>(
    executor: E,
    schema: &TenantSchema,
    id: Uuid,
    finished_at: Option<DateTime<Utc>>,
    status: &str,
    fail_cause: Option<&str>,
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        r#"
        update {}
        set finished_at = $2, status = $3, fail_cause = $4
        where id = $1
        "#,
        schema.table(MERGE_RANGE_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(id)
        .bind(finished_at)
        .bind(status)
        .bind(fail_cause)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Removes every merge range of every entity type.
pub async fn truncate_merge_ranges<'c, E>(executor: E, schema: &TenantSchema) -> sqlx::Result<()>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!("truncate table {}", schema.table(MERGE_RANGE_TABLE));
    sqlx::query(&query).execute(executor).await?;

    Ok(())
}
