//! Batch writes with a row by row fallback.
//!
//! A batch is first written with a single statement. When that statement fails, every row of the
//! batch is written on its own, so one malformed row never keeps its siblings from persisting.
//! Row failures are collected in a [`BatchWriteOutcome`] instead of being raised.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::{ReindexError, ReindexResult};

/// Writes a slice of rows with one statement.
pub trait BatchSink<R> {
    /// Short name of the statement, used in logs.
    fn name(&self) -> &'static str;

    /// Writes all `rows` atomically.
    fn write_batch(&self, rows: &[R]) -> impl Future<Output = ReindexResult<()>> + Send;
}

/// A row that could not be written.
#[derive(Debug, Clone)]
pub struct RowError {
    /// Position of the row in the written slice.
    pub index: usize,
    pub error: ReindexError,
}

/// Result of a batch write.
#[derive(Debug, Clone, Default)]
pub struct BatchWriteOutcome {
    pub succeeded: usize,
    pub failures: Vec<RowError>,
}

impl BatchWriteOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of rows that were attempted.
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failures.len()
    }

    /// Adds the outcome of a chunk that started at `offset` in the overall slice.
    pub fn absorb(&mut self, offset: usize, other: BatchWriteOutcome) {
        self.succeeded += other.succeeded;
        self.failures
            .extend(other.failures.into_iter().map(|failure| RowError {
                index: failure.index + offset,
                error: failure.error,
            }));
    }
}

/// Writes `rows` as one batch and falls back to single row writes when the batch fails.
pub async fn write_with_row_fallback<R, S>(sink: &S, rows: &[R]) -> BatchWriteOutcome
where
    R: Sync,
    S: BatchSink<R> + Sync,
{
    let mut outcome = BatchWriteOutcome::default();
    if rows.is_empty() {
        return outcome;
    }

    let batch_error = match sink.write_batch(rows).await {
        Ok(()) => {
            outcome.succeeded = rows.len();
            return outcome;
        }
        Err(err) => err,
    };

    warn!(
        statement = sink.name(),
        rows = rows.len(),
        error = %batch_error.summary(),
        "batch write failed, retrying row by row"
    );

    for (index, row) in rows.iter().enumerate() {
        match sink.write_batch(std::slice::from_ref(row)).await {
            Ok(()) => outcome.succeeded += 1,
            Err(error) => {
                warn!(
                    statement = sink.name(),
                    row_index = index,
                    error = %error.summary(),
                    "row write failed"
                );
                outcome.failures.push(RowError { index, error });
            }
        }
    }

    debug!(
        statement = sink.name(),
        succeeded = outcome.succeeded,
        failed = outcome.failures.len(),
        "row by row fallback finished"
    );

    outcome
}

/// Splits `rows` into chunks of at most `max_size` and writes each with
/// [`write_with_row_fallback`]. Failure indexes refer to positions in `rows`.
pub async fn write_chunked<R, S>(sink: &S, rows: &[R], max_size: usize) -> BatchWriteOutcome
where
    R: Sync,
    S: BatchSink<R> + Sync,
{
    let mut outcome = BatchWriteOutcome::default();
    let chunk_size = max_size.max(1);

    for (chunk_index, chunk) in rows.chunks(chunk_size).enumerate() {
        let chunk_outcome = write_with_row_fallback(sink, chunk).await;
        outcome.absorb(chunk_index * chunk_size, chunk_outcome);
    }

    outcome
}
