use chrono::Utc;
use postgres::reindex::upload_range::{UploadRangeRow, get_upload_ranges, upsert_upload_ranges};
use reindex::store::merge_range::MergeRangeRepository;
use reindex::store::shared_entity::{RawRecord, SharedEntityRepository};
use reindex::store::upload_range::UploadRangeRepository;
use reindex::test_utils::TestDatabase;
use reindex::types::{ReindexEntityType, SubResourceType, WriteTarget};
use serde_json::{Value, json};
use telemetry::init_test_tracing;
use uuid::Uuid;

fn record(value: Value) -> RawRecord {
    match value {
        Value::Object(map) => map,
        _ => panic!("record must be a json object"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_ranges_are_populated_once() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let merge = MergeRangeRepository::new(
        database.pool.clone(),
        schema.clone(),
        ReindexEntityType::Instance,
        database.tenant_provider(&schema),
        100,
        false,
    )
    .unwrap();
    let records = (1..=5u128)
        .map(|i| record(json!({"id": Uuid::from_u128(i).to_string()})))
        .collect::<Vec<_>>();
    merge.save_entities("member", &records).await.unwrap();

    let uploads = UploadRangeRepository::for_instances(database.pool.clone(), schema.clone(), 2);

    assert!(uploads.get_upload_ranges(false).await.unwrap().is_empty());

    let first = uploads.get_upload_ranges(true).await.unwrap();
    assert_eq!(
        first.iter().map(|r| r.offset).collect::<Vec<_>>(),
        vec![0, 2, 4]
    );

    uploads
        .mark_range_finished(first[0].id, Utc::now())
        .await
        .unwrap();

    // Existing ranges are returned as is.
    let second = uploads.get_upload_ranges(true).await.unwrap();
    assert_eq!(
        second.iter().map(|r| r.id).collect::<Vec<_>>(),
        first.iter().map(|r| r.id).collect::<Vec<_>>()
    );
    assert!(second[0].finished_at.is_some());

    let page = uploads
        .fetch_by(second[2].limit, second[2].offset)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["id"], Uuid::from_u128(5).to_string());

    assert_eq!(uploads.truncate_upload_ranges().await.unwrap(), 3);
    assert!(uploads.get_upload_ranges(false).await.unwrap().is_empty());

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_populations_converge() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let subjects = SharedEntityRepository::new(
        database.pool.clone(),
        schema.clone(),
        database.resolver.clone(),
        SubResourceType::Subject,
        100,
    );
    let records = (0..7)
        .map(|i| {
            record(json!({
                "value": format!("Subject {i}"),
                "instanceId": Uuid::new_v4().to_string(),
                "tenantId": "member"
            }))
        })
        .collect::<Vec<_>>();
    assert!(subjects.save_all(&records, WriteTarget::Main).await.is_complete());

    let uploads = UploadRangeRepository::for_shared_entities(
        database.pool.clone(),
        schema.clone(),
        subjects,
        3,
    );
    let (left, right) = tokio::join!(
        uploads.get_upload_ranges(true),
        uploads.get_upload_ranges(true)
    );
    let (left, right) = (left.unwrap(), right.unwrap());

    assert_eq!(left.len(), 3);
    assert_eq!(left, right);

    let documents = uploads.fetch_by(3, 0).await.unwrap();
    assert_eq!(documents.len(), 3);
    assert_eq!(documents[0]["instances"][0]["count"], 1);
    assert_eq!(documents[0]["instances"][0]["tenantId"], "member");

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn populations_beyond_one_statement_are_saved() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;

    // Six bound columns per range, so 12000 ranges need two statements.
    let created_at = Utc::now();
    let rows = (0..12_000)
        .map(|offset| UploadRangeRow {
            id: Uuid::new_v4(),
            entity_type: "instance".to_string(),
            range_limit: 1,
            range_offset: offset,
            created_at,
            finished_at: None,
        })
        .collect::<Vec<_>>();
    upsert_upload_ranges(&database.pool, &schema, &rows)
        .await
        .unwrap();
    // Repeating the population only refreshes existing rows.
    upsert_upload_ranges(&database.pool, &schema, &rows)
        .await
        .unwrap();

    let stored = get_upload_ranges(&database.pool, &schema, "instance")
        .await
        .unwrap();
    assert_eq!(stored.len(), 12_000);
    assert_eq!(stored[11_999].range_offset, 11_999);

    database.cleanup().await;
}
