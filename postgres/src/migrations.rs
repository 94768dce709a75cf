use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::{Executor, postgres::PgPoolOptions};
use tracing::info;

use crate::schema::TenantSchema;

/// Creates `schema` if needed and applies all pending reindex migrations inside it.
///
/// The `search_path` of the migration connection is pinned to `schema`, so both the tables and
/// the `_sqlx_migrations` bookkeeping table land in the tenant schema.
pub async fn apply_reindex_migrations(
    connection_config: &PgConnectionConfig,
    schema: &TenantSchema,
) -> Result<(), sqlx::Error> {
    let quoted_schema = schema.quoted();

    let pool = PgPoolOptions::new()
        .max_connections(1)
        .after_connect(move |conn, _meta| {
            let create_schema = format!("create schema if not exists {quoted_schema};");
            let set_search_path = format!("set search_path = {quoted_schema};");
            Box::pin(async move {
                conn.execute(create_schema.as_str()).await?;
                conn.execute(set_search_path.as_str()).await?;

                Ok(())
            })
        })
        .connect_with(connection_config.with_db())
        .await?;

    info!(schema = %schema, "applying reindex migrations");

    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await?;
    pool.close().await;

    info!(schema = %schema, "reindex migrations successfully applied");

    Ok(())
}
