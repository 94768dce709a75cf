//! Database fixtures for tests that need a live Postgres.

use config::shared::{PgConnectionConfig, TlsConfig};
use postgres::migrations::apply_reindex_migrations;
use postgres::reindex::known_tenant::{self, KnownTenantRow};
use postgres::schema::{SchemaResolver, TenantSchema};
use postgres::test_utils::{create_pg_database, drop_pg_database};
use sqlx::PgPool;
use uuid::Uuid;

use crate::tenant::ConsortiumTenantProvider;

/// Schema suffix used by every test database.
pub const TEST_SCHEMA_SUFFIX: &str = "mod_search";

/// Connection settings for a fresh, uniquely named test database.
///
/// Reads `TESTS_DATABASE_HOST`, `TESTS_DATABASE_PORT`, `TESTS_DATABASE_USERNAME` and the
/// optional `TESTS_DATABASE_PASSWORD`.
///
/// # Panics
/// Panics if a required variable is missing.
pub fn local_pg_connection_config() -> PgConnectionConfig {
    PgConnectionConfig {
        host: std::env::var("TESTS_DATABASE_HOST").expect("TESTS_DATABASE_HOST must be set"),
        port: std::env::var("TESTS_DATABASE_PORT")
            .expect("TESTS_DATABASE_PORT must be set")
            .parse()
            .expect("TESTS_DATABASE_PORT must be a valid port number"),
        name: Uuid::new_v4().to_string(),
        username: std::env::var("TESTS_DATABASE_USERNAME")
            .expect("TESTS_DATABASE_USERNAME must be set"),
        password: std::env::var("TESTS_DATABASE_PASSWORD")
            .ok()
            .map(Into::into),
        tls: TlsConfig {
            trusted_root_certs: String::new(),
            enabled: false,
        },
    }
}

/// A throwaway database with migrated tenant schemas.
pub struct TestDatabase {
    pub config: PgConnectionConfig,
    pub pool: PgPool,
    pub resolver: SchemaResolver,
}

impl TestDatabase {
    /// Creates the database and migrates the schema of `tenant_id`.
    ///
    /// # Panics
    /// Panics if the database cannot be created or migrated.
    pub async fn spawn(tenant_id: &str) -> (Self, TenantSchema) {
        let config = local_pg_connection_config();
        let pool = create_pg_database(&config).await;
        let database = Self {
            config,
            pool,
            resolver: SchemaResolver::new(TEST_SCHEMA_SUFFIX),
        };
        let schema = database.add_tenant_schema(tenant_id).await;

        (database, schema)
    }

    /// Migrates the schema of another tenant in the same database.
    ///
    /// # Panics
    /// Panics if the tenant id is invalid or the migrations fail.
    pub async fn add_tenant_schema(&self, tenant_id: &str) -> TenantSchema {
        let schema = self
            .resolver
            .schema_for(tenant_id)
            .expect("Invalid test tenant id");
        apply_reindex_migrations(&self.config, &schema)
            .await
            .expect("Failed to apply reindex migrations");

        schema
    }

    /// Registers `tenant_id` in the `known_tenant` table of `schema`.
    ///
    /// # Panics
    /// Panics if the insert fails.
    pub async fn add_known_tenant(
        &self,
        schema: &TenantSchema,
        tenant_id: &str,
        central_id: Option<&str>,
    ) {
        known_tenant::upsert_known_tenant(
            &self.pool,
            schema,
            &KnownTenantRow {
                id: tenant_id.to_string(),
                central_id: central_id.map(ToString::to_string),
                active: true,
            },
        )
        .await
        .expect("Failed to insert known tenant");
    }

    pub fn tenant_provider(&self, schema: &TenantSchema) -> ConsortiumTenantProvider {
        ConsortiumTenantProvider::new(self.pool.clone(), schema.clone())
    }

    /// Closes the pool and drops the database.
    pub async fn cleanup(self) {
        self.pool.close().await;
        drop_pg_database(&self.config).await;
    }
}
