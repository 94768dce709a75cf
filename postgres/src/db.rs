use std::time::Duration;

use config::shared::{IntoConnectOptions, PgConnectionConfig};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Waiting longer than this for a pooled connection fails the query instead of stalling a worker.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens the pool shared by the repositories of every tenant schema.
pub async fn connect_to_database(
    config: &PgConnectionConfig,
    min_connections: u32,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    debug!(
        host = %config.host,
        database = %config.name,
        min_connections,
        max_connections,
        "opening postgres pool"
    );

    PgPoolOptions::new()
        .min_connections(min_connections)
        .max_connections(max_connections)
        .idle_timeout(Some(IDLE_TIMEOUT))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(config.with_db())
        .await
}
