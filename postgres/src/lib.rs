//! Postgres access layer for the reindex pipeline.
//!
//! Every function takes the [`schema::TenantSchema`] it operates on. Schema names are validated
//! and quoted, all values are bound parameters.

pub mod db;
pub mod migrations;
pub mod reindex;
pub mod schema;
#[cfg(feature = "test-utils")]
pub mod test_utils;
