mod lock_test;
mod merge_range_test;
mod reindex_status_test;
mod shared_entity_test;
mod sub_resources_sync_test;
mod upload_range_test;
