use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, prelude::FromRow};

use crate::schema::TenantSchema;

const REINDEX_STATUS_TABLE: &str = "reindex_status";

/// A row from the `reindex_status` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ReindexStatusRow {
    pub entity_type: String,
    pub status: String,
    pub total_merge_ranges: i32,
    pub processed_merge_ranges: i32,
    pub total_upload_ranges: i32,
    pub processed_upload_ranges: i32,
    pub start_time_merge: Option<DateTime<Utc>>,
    pub end_time_merge: Option<DateTime<Utc>>,
    pub start_time_upload: Option<DateTime<Utc>>,
    pub end_time_upload: Option<DateTime<Utc>>,
}

/// Returns all status rows ordered by entity type.
pub async fn get_reindex_statuses(
    pool: &PgPool,
    schema: &TenantSchema,
) -> sqlx::Result<Vec<ReindexStatusRow>> {
    let query = format!(
        r#"
        select entity_type, status, total_merge_ranges, processed_merge_ranges,
               total_upload_ranges, processed_upload_ranges, start_time_merge, end_time_merge,
               start_time_upload, end_time_upload
        from {}
        order by entity_type
        "#,
        schema.table(REINDEX_STATUS_TABLE)
    );

    sqlx::query_as::<_, ReindexStatusRow>(&query)
        .fetch_all(pool)
        .await
}

/// Replaces the whole ledger with `rows` in one transaction.
pub async fn replace_reindex_statuses(
    pool: &PgPool,
    schema: &TenantSchema,
    rows: &[ReindexStatusRow],
) -> sqlx::Result<()> {
    let table = schema.table(REINDEX_STATUS_TABLE);
    let mut tx = pool.begin().await?;

    sqlx::query(&format!("delete from {table}"))
        .execute(&mut *tx)
        .await?;

    if !rows.is_empty() {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "insert into {table} (entity_type, status, total_merge_ranges, processed_merge_ranges, \
             total_upload_ranges, processed_upload_ranges, start_time_merge, end_time_merge, \
             start_time_upload, end_time_upload) "
        ));
        builder.push_values(rows, |mut row, status| {
            row.push_bind(status.entity_type.clone())
                .push_bind(status.status.clone())
                .push_bind(status.total_merge_ranges)
                .push_bind(status.processed_merge_ranges)
                .push_bind(status.total_upload_ranges)
                .push_bind(status.processed_upload_ranges)
                .push_bind(status.start_time_merge)
                .push_bind(status.end_time_merge)
                .push_bind(status.start_time_upload)
                .push_bind(status.end_time_upload);
        });
        builder.build().execute(&mut *tx).await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Marks the merge of `entity_type` as started with `total_merge_ranges` ranges.
///
/// Failed entity types are left untouched; they are only restarted by re-seeding the ledger.
pub async fn set_merge_started(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    status: &str,
    total_merge_ranges: i32,
) -> sqlx::Result<u64> {
    let query = format!(
        r#"
        update {}
        set status = $2, total_merge_ranges = $3, processed_merge_ranges = 0,
            start_time_merge = now(), end_time_merge = null
        where entity_type = $1 and status not in ('MERGE_FAILED', 'UPLOAD_FAILED')
        "#,
        schema.table(REINDEX_STATUS_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .bind(status)
        .bind(total_merge_ranges)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Marks the upload of `entity_type` as started with `total_upload_ranges` ranges.
///
/// Failed entity types are left untouched.
pub async fn set_upload_started(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    status: &str,
    total_upload_ranges: i32,
) -> sqlx::Result<u64> {
    let query = format!(
        r#"
        update {}
        set status = $2, total_upload_ranges = $3, processed_upload_ranges = 0,
            start_time_upload = now(), end_time_upload = null
        where entity_type = $1 and status not in ('MERGE_FAILED', 'UPLOAD_FAILED')
        "#,
        schema.table(REINDEX_STATUS_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .bind(status)
        .bind(total_upload_ranges)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Sets a terminal merge status and closes the merge time window.
pub async fn set_merge_finished(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    status: &str,
) -> sqlx::Result<u64> {
    let query = format!(
        "update {} set status = $2, end_time_merge = now() where entity_type = $1",
        schema.table(REINDEX_STATUS_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .bind(status)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Sets a terminal upload status and closes the upload time window.
pub async fn set_upload_finished(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    status: &str,
) -> sqlx::Result<u64> {
    let query = format!(
        "update {} set status = $2, end_time_upload = now() where entity_type = $1",
        schema.table(REINDEX_STATUS_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .bind(status)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Adds `count` to the processed merge range counter and returns the updated row.
pub async fn add_processed_merge_ranges(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    count: i32,
) -> sqlx::Result<Option<ReindexStatusRow>> {
    let query = format!(
        r#"
        update {}
        set processed_merge_ranges = processed_merge_ranges + $2
        where entity_type = $1
        returning entity_type, status, total_merge_ranges, processed_merge_ranges,
                  total_upload_ranges, processed_upload_ranges, start_time_merge, end_time_merge,
                  start_time_upload, end_time_upload
        "#,
        schema.table(REINDEX_STATUS_TABLE)
    );

    sqlx::query_as::<_, ReindexStatusRow>(&query)
        .bind(entity_type)
        .bind(count)
        .fetch_optional(pool)
        .await
}

/// Adds `count` to the processed upload range counter and returns the updated row.
pub async fn add_processed_upload_ranges(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    count: i32,
) -> sqlx::Result<Option<ReindexStatusRow>> {
    let query = format!(
        r#"
        update {}
        set processed_upload_ranges = processed_upload_ranges + $2
        where entity_type = $1
        returning entity_type, status, total_merge_ranges, processed_merge_ranges,
                  total_upload_ranges, processed_upload_ranges, start_time_merge, end_time_merge,
                  start_time_upload, end_time_upload
        "#,
        schema.table(REINDEX_STATUS_TABLE)
    );

    sqlx::query_as::<_, ReindexStatusRow>(&query)
        .bind(entity_type)
        .bind(count)
        .fetch_optional(pool)
        .await
}
