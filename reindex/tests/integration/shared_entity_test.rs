use chrono::{DateTime, Utc};
use postgres::schema::TenantSchema;
use reindex::error::ErrorKind;
use reindex::store::shared_entity::{RawRecord, SharedEntityRepository};
use reindex::test_utils::TestDatabase;
use reindex::types::{SubResourceType, WriteTarget};
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
    sub_resource: SubResourceType,
) -> SharedEntityRepository {
    SharedEntityRepository::new(
        database.pool.clone(),
        schema.clone(),
        database.resolver.clone(),
        sub_resource,
        100,
    )
}

fn classification(index: u128, number: Option<&str>) -> RawRecord {
    record(json!({
        "number": number,
        "typeId": "ddc",
        "instanceId": Uuid::from_u128(index).to_string(),
        "tenantId": "member",
        "shared": false
    }))
}

#[tokio::test(flavor = "multi_thread")]
async fn one_null_classification_keeps_the_rest_of_the_batch() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, SubResourceType::Classification);

    let records = (0..100u128)
        .map(|i| {
            if i == 56 {
                classification(i, None)
            } else {
                classification(i, Some(&format!("QA{i}")))
            }
        })
        .collect::<Vec<_>>();

    let outcome = repository.save_all(&records, WriteTarget::Main).await;

    assert!(outcome.rejected.is_empty());
    assert_eq!(outcome.entities.succeeded, 99);
    assert_eq!(outcome.entities.failures.len(), 1);
    assert_eq!(outcome.entities.failures[0].index, 56);
    assert_eq!(
        outcome.entities.failures[0].error.kind(),
        ErrorKind::ValidationError
    );
    assert_eq!(repository.count_entities().await.unwrap(), 99);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_relationships_bumps_entity_timestamps() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, SubResourceType::Subject);
    let instance_id = Uuid::new_v4();

    let outcome = repository
        .save_all(
            &[record(json!({
                "value": "Rust (Computer program language)",
                "instanceId": instance_id.to_string(),
                "tenantId": "member",
                "shared": false
            }))],
            WriteTarget::Main,
        )
        .await;
    assert!(outcome.is_complete());

    let before = repository
        .fetch_by_timestamp("member", DateTime::<Utc>::UNIX_EPOCH, None, 10)
        .await
        .unwrap();
    assert_eq!(before.records.len(), 1);
    assert_eq!(before.records[0].instances[0].count, 1);
    assert_eq!(before.records[0].instances[0].tenant_id, "member");

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let bumped = repository
        .delete_by_instance_ids(&[instance_id], Some("member"))
        .await
        .unwrap();
    assert_eq!(bumped, 1);

    let after = repository
        .fetch_by_timestamp("member", DateTime::<Utc>::UNIX_EPOCH, None, 10)
        .await
        .unwrap();
    assert_eq!(after.records.len(), 1);
    assert!(after.records[0].last_updated_date > before.records[0].last_updated_date);
    // The orphaned entity stays, without instance counts.
    assert!(after.records[0].instances.is_empty());
    assert_eq!(repository.count_entities().await.unwrap(), 1);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tenant_scoped_deletes_keep_other_tenants() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("cons").await;
    let repository = repository(&database, &schema, SubResourceType::Contributor);
    let instance_id = Uuid::new_v4().to_string();

    let records = ["cons", "member"]
        .into_iter()
        .map(|tenant_id| {
            record(json!({
                "name": "Klabnik, Steve",
                "contributorNameTypeId": "personal",
                "instanceId": instance_id,
                "tenantId": tenant_id,
                "shared": tenant_id == "cons"
            }))
        })
        .collect::<Vec<_>>();
    let outcome = repository.save_all(&records, WriteTarget::Main).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.entities.succeeded, 1);
    assert_eq!(outcome.relations.succeeded, 2);

    repository
        .delete_by_instance_ids(&[instance_id.parse().unwrap()], Some("member"))
        .await
        .unwrap();

    let lower = "0".repeat(64);
    let upper = "f".repeat(64);
    let records = repository.fetch_by_id_range(&lower, &upper).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].instances.len(), 1);
    assert_eq!(records[0].instances[0].tenant_id, "cons");
    assert!(records[0].instances[0].shared);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn timestamp_cursor_pages_through_ties_in_id_order() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, SubResourceType::Classification);

    // One statement, so every entity shares the same timestamp.
    let records = (0..5u128)
        .map(|i| classification(i, Some(&format!("QA{i}"))))
        .collect::<Vec<_>>();
    assert!(
        repository
            .save_all(&records, WriteTarget::Main)
            .await
            .is_complete()
    );

    let mut seen = Vec::new();
    let mut cursor: (DateTime<Utc>, Option<String>) = (DateTime::<Utc>::UNIX_EPOCH, None);
    loop {
        let page = repository
            .fetch_by_timestamp("member", cursor.0, cursor.1.as_deref(), 2)
            .await
            .unwrap();
        let Some(last) = page.records.last() else {
            break;
        };
        assert_eq!(page.max_timestamp, Some(last.last_updated_date));
        cursor = (last.last_updated_date, Some(last.id.clone()));
        seen.extend(page.records.iter().map(|r| r.id.clone()));
    }

    let mut expected = seen.clone();
    expected.sort();
    expected.dedup();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen, expected);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn staging_rows_are_promoted_into_main_tables() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, SubResourceType::Classification);

    let records = (0..3u128)
        .map(|i| classification(i, Some(&format!("QA{i}"))))
        .collect::<Vec<_>>();
    let outcome = repository.save_all(&records, WriteTarget::Staging).await;
    assert!(outcome.is_complete());
    assert_eq!(repository.count_entities().await.unwrap(), 0);

    let promoted = repository.promote_staging().await.unwrap();

    assert_eq!(promoted.entities, 3);
    assert_eq!(promoted.relations, 3);
    assert_eq!(repository.count_entities().await.unwrap(), 3);
    // Staging is empty, so a second promotion moves nothing.
    let again = repository.promote_staging().await.unwrap();
    assert_eq!(again.entities, 0);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn promotion_bumps_entities_whose_relations_were_replaced() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, SubResourceType::Classification);

    let outcome = repository
        .save_all(&[classification(1, Some("QA-old"))], WriteTarget::Main)
        .await;
    assert!(outcome.is_complete());
    let before = repository
        .fetch_by_timestamp("member", DateTime::<Utc>::UNIX_EPOCH, None, 10)
        .await
        .unwrap();
    assert_eq!(before.records.len(), 1);
    let replaced = before.records[0].clone();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // A full reindex of the tenant no longer produces the old classification.
    let outcome = repository
        .save_all(&[classification(2, Some("QA-new"))], WriteTarget::Staging)
        .await;
    assert!(outcome.is_complete());
    repository.promote_staging().await.unwrap();

    let after = repository
        .fetch_by_timestamp("member", replaced.last_updated_date, None, 10)
        .await
        .unwrap();
    let orphan = after
        .records
        .iter()
        .find(|record| record.id == replaced.id)
        .expect("replaced entity is visible to the timestamp cursor");
    assert!(orphan.instances.is_empty());
    assert_eq!(after.records.len(), 2);

    database.cleanup().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn call_numbers_fall_back_to_main_tables() {
    init_test_tracing();
    let (database, schema) = TestDatabase::spawn("member").await;
    let repository = repository(&database, &schema, SubResourceType::CallNumber);

    let outcome = repository
        .save_all(
            &[record(json!({
                "callNumber": "QA76.73.R87",
                "instanceId": Uuid::new_v4().to_string(),
                "itemId": Uuid::new_v4().to_string(),
                "locationId": Uuid::new_v4().to_string(),
                "tenantId": "member"
            }))],
            WriteTarget::Staging,
        )
        .await;

    assert!(outcome.is_complete());
    assert_eq!(repository.count_entities().await.unwrap(), 1);
    assert_eq!(
        repository.promote_staging().await.unwrap_err().kind(),
        ErrorKind::InvalidState
    );

    let documents = repository.fetch_by(10, 0).await.unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].fields["callNumber"], "QA76.73.R87");

    database.cleanup().await;
}
