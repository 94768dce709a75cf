//! Reindex pipeline core of a multi-tenant, consortium aware search backend.
//!
//! Raw per tenant records are consolidated into merge target tables during the merge phase and
//! paged out to the index during the upload phase. Shared entities (classifications,
//! contributors, subjects and call numbers) are kept deduplicated across tenants and aggregated
//! incrementally by a background pass that is serialized by a per tenant lock.

pub mod batch;
pub mod error;
mod macros;
pub mod ranges;
pub mod retry;
pub mod store;
pub mod tenant;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
