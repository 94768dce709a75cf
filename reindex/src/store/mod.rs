pub mod lock;
pub mod merge_range;
pub mod merge_target;
pub mod reindex_status;
pub mod shared_entity;
pub mod upload_range;
