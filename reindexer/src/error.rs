use std::io;

use config::LoadConfigError;
use config::shared::ValidationError;
use reindex::error::ReindexError;
use telemetry::TracingError;
use thiserror::Error;

pub type ReindexerResult<T> = Result<T, ReindexerError>;

/// Errors that stop the reindexer service.
#[derive(Debug, Error)]
pub enum ReindexerError {
    #[error("failed to load the configuration: {0}")]
    LoadConfig(#[from] LoadConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),

    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] TracingError),

    #[error("failed to migrate schema `{schema}`: {source}")]
    Migration {
        schema: String,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Reindex(#[from] ReindexError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_errors_name_the_schema() {
        let err = ReindexerError::Migration {
            schema: "diku_mod_search".to_string(),
            source: sqlx::Error::PoolTimedOut,
        };

        assert!(err.to_string().contains("`diku_mod_search`"));
    }
}
