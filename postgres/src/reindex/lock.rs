use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::schema::TenantSchema;

const SUB_RESOURCES_LOCK_TABLE: &str = "sub_resources_lock";

/// Sets the lock of `entity_type` if it is free and returns its watermark.
///
/// `locked_at` is stamped with the current time, so the lock's age starts at acquisition and
/// never depends on the watermark. Returns `None` when the lock is already held or the entity
/// type has no lock row.
pub async fn lock_sub_resource(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
) -> sqlx::Result<Option<DateTime<Utc>>> {
    let query = format!(
        r#"
        update {}
        set locked_flag = true, locked_at = now()
        where entity_type = $1 and locked_flag = false
        returning last_updated_date
        "#,
        schema.table(SUB_RESOURCES_LOCK_TABLE)
    );

    sqlx::query_scalar::<_, DateTime<Utc>>(&query)
        .bind(entity_type)
        .fetch_optional(pool)
        .await
}

/// Releases the lock of `entity_type` and stores `watermark` for the next cycle.
pub async fn unlock_sub_resource(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    watermark: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let query = format!(
        r#"
        update {}
        set locked_flag = false, locked_at = null, last_updated_date = $2
        where entity_type = $1
        "#,
        schema.table(SUB_RESOURCES_LOCK_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .bind(watermark)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Stores the watermark reached so far and renews the lock's heartbeat.
pub async fn update_lock_timestamp(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    watermark: DateTime<Utc>,
) -> sqlx::Result<u64> {
    let query = format!(
        r#"
        update {}
        set last_updated_date = $2, locked_at = now()
        where entity_type = $1 and locked_flag = true
        "#,
        schema.table(SUB_RESOURCES_LOCK_TABLE)
    );

    let result = sqlx::query(&query)
        .bind(entity_type)
        .bind(watermark)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Clears the lock of `entity_type` when it is held and its last lock or heartbeat is older
/// than `threshold_ms` milliseconds. The watermark is kept. Returns whether a lock was released.
pub async fn release_stale_lock(
    pool: &PgPool,
    schema: &TenantSchema,
    entity_type: &str,
    threshold_ms: u64,
) -> sqlx::Result<bool> {
    let query = format!(
        r#"
        update {}
        set locked_flag = false, locked_at = null
        where entity_type = $1
          and locked_flag = true
          and coalesce(locked_at, 'epoch') < now() - make_interval(secs => $2)
        returning entity_type
        "#,
        schema.table(SUB_RESOURCES_LOCK_TABLE)
    );

    let released = sqlx::query_scalar::<_, String>(&query)
        .bind(entity_type)
        .bind(threshold_ms as f64 / 1000.0)
        .fetch_optional(pool)
        .await?;

    Ok(released.is_some())
}
