//! Background workers of the reindex pipeline.

pub mod sub_resources;

pub use sub_resources::{SubResourcesSyncWorker, SubResourcesSyncWorkerHandle};
