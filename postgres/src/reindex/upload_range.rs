use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, prelude::FromRow};
use uuid::Uuid;

use crate::reindex::rows_per_statement;
use crate::schema::TenantSchema;

const UPLOAD_RANGE_TABLE: &str = "upload_range";

/// A row from the `upload_range` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct UploadRangeRow {
    pub id: Uuid,
    pub entity_type: String,
    pub range_limit: i32,
    pub range_offset: i32,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Returns the ranges of `entity_type` ordered by offset.
pub async fn get_upload_ranges(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
) -> sqlx::Result<Vec<UploadRangeRow>> {
    let query = format!(
        r#"
        select id, entity_type, range_limit, range_offset, created_at, finished_at
        from {}
        where entity_type = $1
        order by range_offset
        "#,
        schema.table(UPLOAD_RANGE_TABLE)
    );

    sqlx::query_as::<_, UploadRangeRow>(&query)
        .bind(entity_type)
        .fetch_all(pool)
        .await
}

/// Number of bound columns per upload range row.
const UPLOAD_RANGE_COLUMNS: usize = 6;

/// Upserts `ranges` inside one transaction, split into statements that stay under the bind
/// parameter limit. A conflicting id only refreshes `finished_at`, so repeating the same
/// population is harmless.
pub async fn upsert_upload_ranges(
    pool: &PgPool,
    schema: &TenantSchema,
    ranges: &[UploadRangeRow],
) -> sqlx::Result<()> {
    if ranges.is_empty() {
        return Ok(());
    }

    let mut tx = pool.begin().await?;

    for chunk in ranges.chunks(rows_per_statement(UPLOAD_RANGE_COLUMNS)) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "insert into {} (id, entity_type, range_limit, range_offset, created_at, finished_at) ",
            schema.table(UPLOAD_RANGE_TABLE)
        ));
        builder.push_values(chunk, |mut row, range| {
            row.push_bind(range.id)
                .push_bind(range.entity_type.clone())
                .push_bind(range.range_limit)
                .push_bind(range.range_offset)
                .push_bind(range.created_at)
                .push_bind(range.finished_at);
        });
        builder.push(" on conflict (id) do update set finished_at = excluded.finished_at");
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Sets `finished_at` of a range. Returns the number of updated rows.
pub async fn update_upload_range_finished<'c, E>(
    executor: E,
    schema: &TenantSchema,
    id: Uuid,
    finished_at: DateTime<Utc>,
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        "update {} set finished_at = $2 where id = $1",
        schema.table(UPLOAD_RANGE_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(id)
        .bind(finished_at)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Removes the ranges of `entity_type`.
pub async fn delete_upload_ranges<'c, E>(
    executor: E,
    schema: &TenantSchema,
    entity_type: &str,
) -> sqlx::Result<u64>
where
    E: Executor<'c, Database = Postgres>,
{
    let query = format!(
        "delete from {} where entity_type = $1",
        schema.table(UPLOAD_RANGE_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}
