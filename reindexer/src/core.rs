use std::collections::BTreeSet;

use config::shared::ReindexConfig;
use postgres::db::connect_to_database;
use postgres::migrations::apply_reindex_migrations;
use postgres::schema::{SchemaResolver, TenantSchema};
use reindex::error::ReindexError;
use reindex::store::lock::SubResourcesLockRepository;
use reindex::store::shared_entity::SharedEntityRepository;
use reindex::tenant::ConsortiumTenantProvider;
use reindex::types::SubResourceType;
use reindex::workers::{SubResourcesSyncWorker, SubResourcesSyncWorkerHandle};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::consumer::TracingConsumer;
use crate::error::{ReindexerError, ReindexerResult};

/// One connection per sub-resource worker plus headroom for lock bookkeeping.
const MAX_CONNECTIONS: u32 = SubResourceType::ALL.len() as u32 * 2;

/// Migrates every configured schema, then runs one sync worker per sub-resource type until
/// ctrl-c is received.
pub async fn start_reindexer_with_config(config: ReindexConfig) -> ReindexerResult<()> {
    info!("starting reindexer service");

    log_config(&config);

    let Some(data_tenant) = config.data_tenant() else {
        warn!("no tenants configured, nothing to reindex");
        return Ok(());
    };

    let resolver = SchemaResolver::new(config.schema_suffix.clone());
    let data_schema = resolver.schema_for(data_tenant).map_err(ReindexError::from)?;

    // The data tenant may sit outside of `tenants`; every schema is migrated once.
    let tenant_ids = config
        .tenants
        .iter()
        .map(String::as_str)
        .chain([data_tenant])
        .collect::<BTreeSet<_>>();
    for tenant_id in &tenant_ids {
        let schema = resolver.schema_for(tenant_id).map_err(ReindexError::from)?;
        migrate(&config, &schema).await?;
    }

    let pool = connect_to_database(&config.pg_connection, 1, MAX_CONNECTIONS)
        .await
        .map_err(ReindexError::from)?;

    let tenants = ConsortiumTenantProvider::new(pool.clone(), data_schema.clone());
    let known_tenants = tenants.refresh().await?;
    info!(known_tenants, data_schema = %data_schema, "loaded consortium tenants");

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let locks = SubResourcesLockRepository::new(pool.clone(), resolver.clone());
    let handles = SubResourceType::ALL
        .into_iter()
        .map(|sub_resource| {
            let source = SharedEntityRepository::new(
                pool.clone(),
                data_schema.clone(),
                resolver.clone(),
                sub_resource,
                config.batch.max_size,
            );
            SubResourcesSyncWorker::new(
                locks.clone(),
                source,
                TracingConsumer,
                config.sub_resources.clone(),
            )
            .start(
                sync_tenant_ids(&config),
                config.sub_resources.sync_interval(),
                shutdown_rx.clone(),
            )
        })
        .collect::<Vec<_>>();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping sub-resource workers");

    // Fails only when every worker has already stopped.
    let _ = shutdown_tx.send(());
    wait_for_workers(handles).await?;

    pool.close().await;
    info!("reindexer service stopped");

    Ok(())
}

/// Shared entities and their locks live in the data tenant's schema only, so that is the one
/// schema the workers aggregate. Member tenants reach it through their consortium.
fn sync_tenant_ids(config: &ReindexConfig) -> Vec<String> {
    config.data_tenant().map(str::to_string).into_iter().collect()
}

async fn migrate(config: &ReindexConfig, schema: &TenantSchema) -> ReindexerResult<()> {
    apply_reindex_migrations(&config.pg_connection, schema)
        .await
        .map_err(|source| ReindexerError::Migration {
            schema: schema.to_string(),
            source,
        })
}

async fn wait_for_workers(handles: Vec<SubResourcesSyncWorkerHandle>) -> ReindexerResult<()> {
    let mut errors = Vec::new();
    for handle in handles {
        if let Err(err) = handle.wait().await {
            errors.push(err);
        }
    }

    if errors.is_empty() {
        return Ok(());
    }

    Err(ReindexError::from(errors).into())
}

fn log_config(config: &ReindexConfig) {
    info!(
        host = %config.pg_connection.host,
        port = config.pg_connection.port,
        dbname = %config.pg_connection.name,
        username = %config.pg_connection.username,
        tls_enabled = config.pg_connection.tls.enabled,
        "postgres connection config"
    );
    info!(
        schema_suffix = %config.schema_suffix,
        tenants = ?config.tenants,
        central_tenant = ?config.central_tenant,
        "tenant config"
    );
    info!(
        batch_max_size = config.batch.max_size,
        merge_range_count = config.merge.range_count,
        upload_range_size = config.upload.range_size,
        fetch_limit = config.sub_resources.fetch_limit,
        sync_interval_ms = config.sub_resources.sync_interval_ms,
        watermark_overlap_ms = config.sub_resources.watermark_overlap_ms,
        "reindex config"
    );
}
