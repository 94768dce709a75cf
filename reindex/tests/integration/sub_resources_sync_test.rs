use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use config::shared::SubResourcesConfig;
use postgres::schema::TenantSchema;
use reindex::error::ReindexResult;
use reindex::store::lock::{SubResourceLockStore, SubResourcesLockRepository};
use reindex::store::shared_entity::{RawRecord, SharedEntityRecord, SharedEntityRepository};
use reindex::test_utils::TestDatabase;
use reindex::types::{SubResourceType, WriteTarget};
use reindex::workers::SubResourcesSyncWorker;
use reindex::workers::sub_resources::{SubResourceConsumer, SyncCycleOutcome};
use serde_json::{Value, json};
use telemetry::init_test_tracing;
use tokio::sync::Notify;
use uuid::Uuid;

fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        _ => panic!("record must be a json object"),
    }
}

fn subjects(database: &TestDatabase, schema: &TenantSchema) -> SharedEntityRepository {
    SharedEntityRepository::new(
        database.pool.clone(),
        schema.clone(),
        database.resolver.clone(),
        SubResourceType::Subject,
        100,
    )
}

fn locks(database: &TestDatabase) -> SubResourcesLockRepository {
    SubResourcesLockRepository::new(database.pool.clone(), database.resolver.clone())
}

fn config() -> SubResourcesConfig {
    SubResourcesConfig {
        fetch_limit: 2,
        stale_lock_threshold_ms: 600_000,
        watermark_overlap_ms: 0,
        ..SubResourcesConfig::default()
    }
}

async fn save_subjects(repository: &SharedEntityRepository, count: usize) {
    let records = (0..count)
        .map(|i| {
            record(json!({
                "value": format!("Subject {i}"),
                "instanceId": Uuid::new_v4().to_string(),
                "tenantId": "member",
                "shared": false
            }))
        })
        .collect::<Vec<_>>();

    assert!(
        repository
            .save_all(&records, WriteTarget::Main)
            .await
            .is_complete()
    );
}

#[derive(Debug, Clone, Default)]
struct CollectingConsumer {
    ids: Arc<Mutex<Vec<String>>>,
}

impl SubResourceConsumer for CollectingConsumer {
    async fn consume(
        &self,
        _entity_type: SubResourceType,
        _tenant_id: &str,
        records: &[SharedEntityRecord],
    ) -> ReindexResult<()> {
        self.ids
            .lock()
            .unwrap()
            .extend(records.iter().map(|record| record.id.clone()));

        Ok(())
    }
}

/// Holds the first page until released.
#[derive(Debug, Clone, Default)]
struct BlockingConsumer {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl SubResourceConsumer for BlockingConsumer {
    async fn consume(
        &self,
        _entity_type: SubResourceType,
        _tenant_id: &str,
        _records: &[SharedEntityRecord],
    ) -> ReindexResult<()> {
        self.entered.notify_one();
        self.release.notified().await;

        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn cycle_aggregates_stored_entities_and_persists_the_watermark() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = subjects(&database, &schema);
    save_subjects(&repository, 3).await;

    let consumer = CollectingConsumer::default();
    let worker =
        SubResourcesSyncWorker::new(locks(&database), repository, consumer.clone(), config());

    let SyncCycleOutcome::Completed { records, watermark } =
        worker.run_cycle("member").await.unwrap()
    else {
        panic!("the lock is free");
    };
    assert_eq!(records, 3);
    assert!(watermark > DateTime::<Utc>::UNIX_EPOCH);
    assert_eq!(consumer.ids.lock().unwrap().len(), 3);

    // Nothing changed since, so the next cycle keeps the watermark.
    let outcome = worker.run_cycle("member").await.unwrap();
    assert_eq!(
        outcome,
        SyncCycleOutcome::Completed {
            records: 0,
            watermark
        }
    );

    let stored = locks(&database)
        .lock_sub_resource(SubResourceType::Subject, "member")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, watermark);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn overlapping_cycles_leave_the_running_one_alone() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    save_subjects(&subjects(&database, &schema), 1).await;

    let blocking = BlockingConsumer::default();
    let running = Arc::new(SubResourcesSyncWorker::new(
        locks(&database),
        subjects(&database, &schema),
        blocking.clone(),
        config(),
    ));
    let cycle = tokio::spawn({
        let running = running.clone();
        async move { running.run_cycle("member").await }
    });
    blocking.entered.notified().await;

    // The lock was just taken, so the stale check of the second worker must not release it
    // even though the stored watermark is the epoch.
    let overlapping = SubResourcesSyncWorker::new(
        locks(&database),
        subjects(&database, &schema),
        CollectingConsumer::default(),
        config(),
    );
    assert_eq!(
        overlapping.run_cycle("member").await.unwrap(),
        SyncCycleOutcome::Skipped
    );

    blocking.release.notify_one();
    let outcome = cycle.await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        SyncCycleOutcome::Completed { records: 1, .. }
    ));

    database.cleanup().await;
}
