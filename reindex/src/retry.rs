use std::future::Future;

use chrono::Utc;
use config::shared::RetryConfig;
use tracing::{error, info, warn};

use crate::error::ReindexResult;
use crate::store::merge_range::{MergeRange, RangeStatusStore};
use crate::types::MergeRangeStatus;

/// Runs the work of a merge range under a fixed backoff retry policy and records the result.
#[derive(Debug, Clone)]
pub struct RangeRetryRunner<S> {
    store: S,
    retry: RetryConfig,
}

impl<S> RangeRetryRunner<S>
where
    S: RangeStatusStore,
{
    pub fn new(store: S, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Marks `range` in progress and runs `work` until it succeeds or the attempts run out.
    ///
    /// Returns [`MergeRangeStatus::Success`] or [`MergeRangeStatus::Fail`]. A failed range keeps
    /// the last error as its cause. Only errors of the status store are returned.
    pub async fn run<F, Fut>(
        &self,
        range: &MergeRange,
        mut work: F,
    ) -> ReindexResult<MergeRangeStatus>
    where
        F: FnMut(&MergeRange) -> Fut,
        Fut: Future<Output = ReindexResult<()>>,
    {
        self.store
            .update_range_status(range.id, None, MergeRangeStatus::InProgress, None)
            .await?;

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        let last_error = loop {
            match work(range).await {
                Ok(()) => {
                    self.store
                        .update_range_status(
                            range.id,
                            Some(Utc::now()),
                            MergeRangeStatus::Success,
                            None,
                        )
                        .await?;
                    info!(
                        range_id = %range.id,
                        entity_type = %range.entity_type,
                        tenant_id = %range.tenant_id,
                        attempt,
                        "merge range succeeded"
                    );

                    return Ok(MergeRangeStatus::Success);
                }
                Err(err) if attempt < max_attempts => {
                    warn!(
                        range_id = %range.id,
                        attempt,
                        max_attempts,
                        error = %err.summary(),
                        "merge range attempt failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff()).await;
                }
                Err(err) => break err,
            }
        };

        let cause = last_error.summary();
        self.store
            .update_range_status(
                range.id,
                Some(Utc::now()),
                MergeRangeStatus::Fail,
                Some(cause.as_str()),
            )
            .await?;
        error!(
            range_id = %range.id,
            entity_type = %range.entity_type,
            tenant_id = %range.tenant_id,
            attempts = max_attempts,
            cause = %cause,
            "merge range failed"
        );

        Ok(MergeRangeStatus::Fail)
    }
}
