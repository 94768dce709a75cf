use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batch sizing for shared entity and merge target writes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of rows sent in a single batched statement.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
}

impl BatchConfig {
    /// Postgres accepts at most 65535 bind parameters per statement and no row binds more
    /// than ten of them.
    pub const MAX_MAX_SIZE: usize = 6_500;

    pub const DEFAULT_MAX_SIZE: usize = 1_000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 || self.max_size > Self::MAX_MAX_SIZE {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch.max_size".to_string(),
                constraint: format!("must be between 1 and {}", Self::MAX_MAX_SIZE),
            });
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
        }
    }
}

fn default_batch_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}
