use chrono::Utc;
use config::shared::RetryConfig;
use postgres::schema::TenantSchema;
use reindex::error::ErrorKind;
use reindex::ranges::build_merge_ranges;
use reindex::reindex_error;
use reindex::retry::RangeRetryRunner;
use reindex::store::merge_range::MergeRangeRepository;
use reindex::store::shared_entity::RawRecord;
use reindex::store::upload_range::UploadRangeRepository;
use reindex::test_utils::TestDatabase;
use reindex::types::{MergeRangeStatus, ReindexEntityType};
use serde_json::{Value, json};
use telemetry::init_test_tracing;
use uuid::Uuid;

fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        _ => panic!("record must be a json object"),
    }
}

fn repository(
    database: &TestDatabase,
    schema: &TenantSchema,
    entity_type: ReindexEntityType,
    instance_children_index_enabled: bool,
) -> MergeRangeRepository {
    MergeRangeRepository::new(
        database.pool.clone(),
        schema.clone(),
        entity_type,
        database.tenant_provider(schema),
        50,
        instance_children_index_enabled,
    )
    .unwrap()
}

fn instance(id: Uuid) -> RawRecord {
    record(json!({"id": id.to_string(), "title": format!("Title {id}")}))
}

#[tokio::test(flavor = "multi_thread")]
async fn saved_ranges_cover_the_keyspace_and_track_failures() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    let repository = repository(&database, &schema, ReindexEntityType::Item, false);

    let ranges = build_merge_ranges(ReindexEntityType::Item, "member", 4).unwrap();
    repository.save_merge_ranges(&ranges).await.unwrap();

    let stored = repository.get_merge_ranges().await.unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[0].lower, Uuid::nil());
    assert_eq!(stored[3].upper, Uuid::from_u128(u128::MAX));
    for pair in stored.windows(2) {
        assert_eq!(pair[0].upper.as_u128() + 1, pair[1].lower.as_u128());
    }

    repository
        .update_range_status(
            stored[2].id,
            Some(Utc::now()),
            MergeRangeStatus::Fail,
            Some("Connection reset"),
        )
        .await
        .unwrap();

    let failed = repository.get_failed_merge_ranges().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, stored[2].id);
    assert_eq!(failed[0].fail_cause.as_deref(), Some("Connection reset"));

    let err = repository
        .update_range_status(Uuid::new_v4(), None, MergeRangeStatus::Success, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    repository.truncate_merge_ranges().await.unwrap();
    assert!(repository.get_merge_ranges().await.unwrap().is_empty());

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn range_counts_beyond_one_statement_are_saved() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    let repository = repository(&database, &schema, ReindexEntityType::Instance, false);

    // Nine bound columns per range, so 8000 ranges need two statements.
    let ranges = build_merge_ranges(ReindexEntityType::Instance, "member", 8000).unwrap();
    repository.save_merge_ranges(&ranges).await.unwrap();

    let stored = repository.get_merge_ranges().await.unwrap();
    assert_eq!(stored.len(), 8000);
    assert_eq!(stored[7999].upper, Uuid::from_u128(u128::MAX));

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_runner_records_the_final_status() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    let repository = repository(&database, &schema, ReindexEntityType::Holding, false);

    let ranges = build_merge_ranges(ReindexEntityType::Holding, "member", 2).unwrap();
    repository.save_merge_ranges(&ranges).await.unwrap();

    let runner = RangeRetryRunner::new(
        repository.clone(),
        RetryConfig {
            max_attempts: 2,
            backoff_ms: 1,
        },
    );
    let succeeded = runner.run(&ranges[0], |_| async { Ok(()) }).await.unwrap();
    let failed = runner
        .run(&ranges[1], |_| async {
            Err(reindex_error!(ErrorKind::QueryFailed, "Merge query failed"))
        })
        .await
        .unwrap();

    assert_eq!(succeeded, MergeRangeStatus::Success);
    assert_eq!(failed, MergeRangeStatus::Fail);

    let stored = repository.get_merge_ranges().await.unwrap();
    let first = stored.iter().find(|r| r.id == ranges[0].id).unwrap();
    assert_eq!(first.status, MergeRangeStatus::Success);
    assert!(first.finished_at.is_some());
    let failed = repository.get_failed_merge_ranges().await.unwrap();
    assert_eq!(failed[0].fail_cause.as_deref(), Some("Merge query failed"));

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn instances_of_the_central_tenant_are_shared() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    database.add_known_tenant(&schema, "cons", None).await;
    database.add_known_tenant(&schema, "member", Some("cons")).await;
    let repository = repository(&database, &schema, ReindexEntityType::Instance, false);

    let central_id = Uuid::from_u128(1);
    let member_id = Uuid::from_u128(2);
    let central = repository
        .save_entities("cons", &[instance(central_id)])
        .await
        .unwrap();
    let member = repository
        .save_entities("member", &[instance(member_id)])
        .await
        .unwrap();
    assert!(central.is_complete());
    assert!(member.is_complete());

    let uploads = UploadRangeRepository::for_instances(database.pool.clone(), schema.clone(), 10);
    let documents = uploads.fetch_by(10, 0).await.unwrap();
    assert_eq!(documents.len(), 2);
    assert_eq!(documents[0]["id"], central_id.to_string());
    assert_eq!(documents[0]["shared"], true);
    assert_eq!(documents[1]["tenantId"], "member");
    assert_eq!(documents[1]["shared"], false);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_records_are_rejected_without_failing_the_batch() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, ReindexEntityType::Holding, false);
    let instance_id = Uuid::new_v4().to_string();

    let records = vec![
        record(json!({"id": Uuid::new_v4().to_string(), "instanceId": instance_id})),
        record(json!({"id": "not-a-uuid", "instanceId": instance_id})),
        record(json!({"id": Uuid::new_v4().to_string(), "instanceId": instance_id})),
    ];
    let outcome = repository.save_entities("member", &records).await.unwrap();

    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].index, 1);
    assert_eq!(outcome.written.succeeded, 2);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_records_in_one_save_keep_the_last_version() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, ReindexEntityType::Instance, false);
    let id = Uuid::new_v4();
    let other = Uuid::new_v4();

    let records = vec![
        record(json!({"id": id.to_string(), "title": "First"})),
        instance(other),
        record(json!({"id": id.to_string(), "title": "Second"})),
    ];
    let outcome = repository.save_entities("member", &records).await.unwrap();

    assert!(outcome.rejected.is_empty());
    assert!(outcome.written.is_complete());
    assert_eq!(outcome.written.succeeded, 2);

    let title = sqlx::query_scalar::<_, String>(&format!(
        "select json->>'title' from {} where id = $1",
        schema.table("instance")
    ))
    .bind(id)
    .fetch_one(&database.pool)
    .await
    .unwrap();
    assert_eq!(title, "Second");

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_are_soft_only_with_the_children_index_enabled() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let soft = repository(&database, &schema, ReindexEntityType::Instance, true);
    let hard = repository(&database, &schema, ReindexEntityType::Instance, false);
    let uploads = UploadRangeRepository::for_instances(database.pool.clone(), schema.clone(), 10);

    let ids = (1..=3).map(Uuid::from_u128).collect::<Vec<_>>();
    let records = ids.iter().copied().map(instance).collect::<Vec<_>>();
    soft.save_entities("member", &records).await.unwrap();

    // Flagged rows stop counting but are revived by the next upsert.
    assert_eq!(soft.delete_entities(&ids[..1], false).await.unwrap(), 1);
    assert_eq!(uploads.count_entities().await.unwrap(), 2);
    soft.save_entities("member", &records[..1]).await.unwrap();
    assert_eq!(uploads.count_entities().await.unwrap(), 3);

    // Explicitly hard deletes remove the row even with the flag on.
    assert_eq!(
        soft.delete_entities_for_tenant(&ids[1..2], "member", true)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        hard.delete_entities_for_tenant(&ids[2..], "other", false)
            .await
            .unwrap(),
        0
    );
    assert_eq!(hard.delete_entities(&ids[2..], false).await.unwrap(), 1);
    assert_eq!(uploads.count_entities().await.unwrap(), 1);

    database.cleanup().await;
}
