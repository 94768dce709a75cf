use chrono::{DateTime, Duration, Utc};
use reindex::store::lock::{SubResourceLockStore, SubResourcesLockRepository};
use reindex::test_utils::TestDatabase;
use reindex::types::SubResourceType;
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn lock_is_exclusive_and_unlock_stores_the_watermark() {
    init_test_tracing();
    let (database, _schema) = TestDatabase::spawn("member").await;
    let locks = SubResourcesLockRepository::new(database.pool.clone(), database.resolver.clone());
    let entity_type = SubResourceType::Contributor;

    let watermark = locks
        .lock_sub_resource(entity_type, "member")
        .await
        .unwrap();
    assert_eq!(watermark, Some(DateTime::<Utc>::UNIX_EPOCH));

    // A second caller sees the lock as held.
    let second = locks
        .lock_sub_resource(entity_type, "member")
        .await
        .unwrap();
    assert_eq!(second, None);

    // Other entity types have their own lock.
    assert!(
        locks
            .lock_sub_resource(SubResourceType::Subject, "member")
            .await
            .unwrap()
            .is_some()
    );

    let new_watermark = Utc::now() - Duration::minutes(1);
    locks
        .unlock_sub_resource(entity_type, new_watermark, "member")
        .await
        .unwrap();

    let relocked = locks
        .lock_sub_resource(entity_type, "member")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relocked.timestamp_micros(), new_watermark.timestamp_micros());

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stale_locks_are_released() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let locks = SubResourcesLockRepository::new(database.pool.clone(), database.resolver.clone());
    let entity_type = SubResourceType::Classification;

    // Nothing to release while the lock is free.
    assert!(
        !locks
            .check_and_release_stale_lock(entity_type, "member", 1_000)
            .await
            .unwrap()
    );

    locks
        .lock_sub_resource(entity_type, "member")
        .await
        .unwrap()
        .unwrap();
    locks
        .update_lock_timestamp(entity_type, Utc::now(), "member")
        .await
        .unwrap();

    // A fresh heartbeat keeps the lock.
    assert!(
        !locks
            .check_and_release_stale_lock(entity_type, "member", 60_000)
            .await
            .unwrap()
    );

    // The holder stopped sending heartbeats half an hour ago.
    sqlx::query(&format!(
        "update {} set locked_at = now() - interval '30 minutes' where entity_type = $1",
        schema.table("sub_resources_lock")
    ))
    .bind(entity_type.as_str())
    .execute(&database.pool)
    .await
    .unwrap();

    assert!(
        locks
            .check_and_release_stale_lock(entity_type, "member", 60_000)
            .await
            .unwrap()
    );
    assert!(
        locks
            .lock_sub_resource(entity_type, "member")
            .await
            .unwrap()
            .is_some()
    );

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fresh_lock_with_an_old_watermark_is_not_stale() {
    init_test_tracing();
    let (database, _schema) = TestDatabase::spawn("member").await;
    let locks = SubResourcesLockRepository::new(database.pool.clone(), database.resolver.clone());
    let entity_type = SubResourceType::Subject;

    // Never synced, so the watermark is the epoch.
    let watermark = locks
        .lock_sub_resource(entity_type, "member")
        .await
        .unwrap();
    assert_eq!(watermark, Some(DateTime::<Utc>::UNIX_EPOCH));

    assert!(
        !locks
            .check_and_release_stale_lock(entity_type, "member", 600_000)
            .await
            .unwrap()
    );
    assert_eq!(
        locks
            .lock_sub_resource(entity_type, "member")
            .await
            .unwrap(),
        None
    );

    // Storing an old watermark renews the heartbeat instead of aging the lock.
    locks
        .update_lock_timestamp(entity_type, Utc::now() - Duration::days(7), "member")
        .await
        .unwrap();
    assert!(
        !locks
            .check_and_release_stale_lock(entity_type, "member", 600_000)
            .await
            .unwrap()
    );

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_tenant_ids_never_reach_the_database() {
    init_test_tracing();
    let (database, _schema) = TestDatabase::spawn("member").await;
    let locks = SubResourcesLockRepository::new(database.pool.clone(), database.resolver.clone());

    let err = locks
        .lock_sub_resource(SubResourceType::Subject, "member\"; drop table x; --")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), reindex::error::ErrorKind::InvalidTenant);

    database.cleanup().await;
}
