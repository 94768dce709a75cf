use std::collections::HashMap;
use std::sync::Arc;

use postgres::reindex::known_tenant::{self, KnownTenantRow};
use postgres::schema::TenantSchema;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ReindexResult;

/// Consortium membership of a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownTenant {
    pub id: String,
    /// Central tenant of the consortium, `None` for the central tenant itself.
    pub central_id: Option<String>,
    pub active: bool,
}

impl KnownTenant {
    pub fn is_central(&self) -> bool {
        self.active && self.central_id.is_none()
    }
}

impl From<KnownTenantRow> for KnownTenant {
    fn from(row: KnownTenantRow) -> Self {
        Self {
            id: row.id,
            central_id: row.central_id,
            active: row.active,
        }
    }
}

/// Answers central or member questions about tenants from the `known_tenant` table.
///
/// Tenants are loaded on first use and cached until [`ConsortiumTenantProvider::refresh`].
#[derive(Debug, Clone)]
pub struct ConsortiumTenantProvider {
    pool: PgPool,
    schema: TenantSchema,
    cache: Arc<Mutex<Option<HashMap<String, KnownTenant>>>>,
}

impl ConsortiumTenantProvider {
    pub fn new(pool: PgPool, schema: TenantSchema) -> Self {
        Self {
            pool,
            schema,
            cache: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether `tenant_id` is a known, active tenant without a central tenant.
    pub async fn is_central_tenant(&self, tenant_id: &str) -> ReindexResult<bool> {
        Ok(self
            .tenant(tenant_id)
            .await?
            .is_some_and(|tenant| tenant.is_central()))
    }

    /// Returns the central tenant of `tenant_id`, the tenant itself when it is central, or `None`
    /// when the tenant is unknown or inactive.
    pub async fn central_tenant(&self, tenant_id: &str) -> ReindexResult<Option<String>> {
        let central = self
            .tenant(tenant_id)
            .await?
            .filter(|tenant| tenant.active)
            .map(|tenant| tenant.central_id.unwrap_or(tenant.id));

        Ok(central)
    }

    /// Reloads the tenants from the database. Returns the number of known tenants.
    pub async fn refresh(&self) -> ReindexResult<usize> {
        let tenants = self.load().await?;
        let count = tenants.len();
        *self.cache.lock().await = Some(tenants);

        Ok(count)
    }

    async fn tenant(&self, tenant_id: &str) -> ReindexResult<Option<KnownTenant>> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }

        Ok(cache
            .as_ref()
            .and_then(|tenants| tenants.get(tenant_id))
            .cloned())
    }

    async fn load(&self) -> ReindexResult<HashMap<String, KnownTenant>> {
        let rows = known_tenant::get_known_tenants(&self.pool, &self.schema).await?;
        debug!(schema = %self.schema, tenants = rows.len(), "loaded known tenants");

        Ok(rows
            .into_iter()
            .map(|row| (row.id.clone(), KnownTenant::from(row)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_active_tenants_without_central_are_central() {
        let central = KnownTenant {
            id: "cons".to_string(),
            central_id: None,
            active: true,
        };
        let member = KnownTenant {
            id: "college".to_string(),
            central_id: Some("cons".to_string()),
            active: true,
        };
        let retired = KnownTenant {
            active: false,
            ..central.clone()
        };

        assert!(central.is_central());
        assert!(!member.is_central());
        assert!(!retired.is_central());
    }
}
