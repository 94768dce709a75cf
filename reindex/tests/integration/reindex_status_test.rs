use reindex::error::ErrorKind;
use reindex::store::reindex_status::{ReindexStatus, ReindexStatusRepository};
use reindex::test_utils::TestDatabase;
use reindex::types::{ReindexEntityType, ReindexStatusKind};
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn merge_progress_is_tracked_until_completion() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    let statuses = ReindexStatusRepository::new(database.pool.clone(), schema.clone());

    let seed = [ReindexEntityType::Instance, ReindexEntityType::Item]
        .into_iter()
        .map(|entity_type| ReindexStatus::new(entity_type, ReindexStatusKind::MergeInProgress))
        .collect::<Vec<_>>();
    statuses.save_reindex_status_records(&seed).await.unwrap();

    // Seeded rows have not started any phase yet.
    let stored = statuses.get_reindex_statuses().await.unwrap();
    assert!(stored.iter().all(|status| !status.is_merge_completed()));
    assert!(stored.iter().all(|status| !status.is_upload_completed()));

    statuses
        .set_merge_reindex_started(ReindexEntityType::Instance, 3)
        .await
        .unwrap();
    let status = statuses
        .add_processed_merge_ranges(ReindexEntityType::Instance, 2)
        .await
        .unwrap();
    assert_eq!(status.processed_merge_ranges, 2);
    assert!(!status.is_merge_completed());

    let status = statuses
        .add_processed_merge_ranges(ReindexEntityType::Instance, 1)
        .await
        .unwrap();
    assert!(status.is_merge_completed());
    assert!(status.start_time_merge.is_some());

    statuses
        .set_upload_reindex_started(ReindexEntityType::Instance, 2)
        .await
        .unwrap();
    let status = statuses
        .add_processed_upload_ranges(ReindexEntityType::Instance, 1)
        .await
        .unwrap();
    assert_eq!(status.status, ReindexStatusKind::UploadInProgress);
    assert!(!status.is_upload_completed());

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_types_need_a_reseed_to_restart() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    let statuses = ReindexStatusRepository::new(database.pool.clone(), schema.clone());

    statuses
        .save_reindex_status_records(&[ReindexStatus::new(
            ReindexEntityType::Holding,
            ReindexStatusKind::MergeInProgress,
        )])
        .await
        .unwrap();
    statuses
        .set_reindex_merge_failed(ReindexEntityType::Holding)
        .await
        .unwrap();

    let err = statuses
        .set_merge_reindex_started(ReindexEntityType::Holding, 4)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let stored = statuses.get_reindex_statuses().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ReindexStatusKind::MergeFailed);
    assert!(stored[0].end_time_merge.is_some());

    // Re-seeding replaces every previous row.
    statuses
        .save_reindex_status_records(&[ReindexStatus::new(
            ReindexEntityType::Subject,
            ReindexStatusKind::MergeCompleted,
        )])
        .await
        .unwrap();
    let stored = statuses.get_reindex_statuses().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].entity_type, ReindexEntityType::Subject);
    statuses
        .set_upload_reindex_started(ReindexEntityType::Subject, 1)
        .await
        .unwrap();

    database.cleanup().await;
}
