use sqlx::{PgPool, prelude::FromRow};

use crate::schema::TenantSchema;

const KNOWN_TENANT_TABLE: &str = "known_tenant";

/// A row from the `known_tenant` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct KnownTenantRow {
    pub id: String,
    pub central_id: Option<String>,
    pub active: bool,
}

/// Returns every known tenant.
pub async fn get_known_tenants(
    pool: &PgPool,
    schema: &TenantSchema,
) -> sqlx::Result<Vec<KnownTenantRow>> {
    let query = format!(
        "select id, central_id, active from {} order by id",
        schema.table(KNOWN_TENANT_TABLE)
    );

    sqlx::query_as::<_, KnownTenantRow>(&query)
        .fetch_all(pool)
        .await
}

/// Inserts or replaces a tenant record.
pub async fn upsert_known_tenant(
    pool: &PgPool,
    schema: &TenantSchema,
    tenant: &KnownTenantRow,
) -> sqlx::Result<()> {
    let query = format!(
        r#"
        insert into {} (id, central_id, active)
        values ($1, $2, $3)
        on conflict (id) do update set central_id = excluded.central_id, active = excluded.active
        "#,
        schema.table(KNOWN_TENANT_TABLE)
    );

    sqlx::query(&query)
        .bind(&tenant.id)
        .bind(&tenant.central_id)
        .bind(tenant.active)
        .execute(pool)
        .await?;

    Ok(())
}
