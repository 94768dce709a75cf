use config::shared::{IntoConnectOptions, PgConnectionConfig};
use pg_escape::quote_identifier;
use sqlx::{Connection, Executor, PgConnection, PgPool};
use tracing::warn;

/// Creates a fresh database named after `config.name` and opens a pool on it.
///
/// # Panics
/// Panics when the server is unreachable or the database already exists.
pub async fn create_pg_database(config: &PgConnectionConfig) -> PgPool {
    let mut admin = PgConnection::connect_with(&config.without_db())
        .await
        .expect("test database server must be reachable");
    let statement = format!("create database {}", quote_identifier(&config.name));
    admin
        .execute(statement.as_str())
        .await
        .expect("test database must not exist yet");
    admin.close().await.ok();

    PgPool::connect_with(config.with_db())
        .await
        .expect("freshly created test database must accept connections")
}

/// Drops the database named after `config.name`, closing its remaining sessions first.
///
/// Failures are logged so that cleanup never fails a test.
pub async fn drop_pg_database(config: &PgConnectionConfig) {
    let mut admin = match PgConnection::connect_with(&config.without_db()).await {
        Ok(admin) => admin,
        Err(err) => {
            warn!(database = %config.name, error = %err, "cannot connect to drop test database");
            return;
        }
    };

    let terminated = sqlx::query(
        "select pg_terminate_backend(pid) from pg_stat_activity \
         where datname = $1 and pid <> pg_backend_pid()",
    )
    .bind(&config.name)
    .execute(&mut admin)
    .await;
    if let Err(err) = terminated {
        warn!(database = %config.name, error = %err, "cannot terminate test database sessions");
    }

    let statement = format!("drop database if exists {}", quote_identifier(&config.name));
    if let Err(err) = admin.execute(statement.as_str()).await {
        warn!(database = %config.name, error = %err, "cannot drop test database");
    }
}
