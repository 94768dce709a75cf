pub mod known_tenant;
pub mod lock;
pub mod merge_range;
pub mod merge_target;
pub mod shared_entity;
pub mod status;
pub mod upload_range;

/// Postgres accepts at most this many bind parameters in one statement.
const MAX_BIND_PARAMETERS: usize = u16::MAX as usize;

/// Number of rows of `columns` bound values that fit into a single statement.
fn rows_per_statement(columns: usize) -> usize {
    (MAX_BIND_PARAMETERS / columns.max(1)).max(1)
}
