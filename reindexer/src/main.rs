//! Reindexer service binary.
//!
//! Migrates the configured tenant schemas and keeps the shared sub-resource entities of every
//! tenant aggregated until a shutdown signal arrives.

use config::load_config;
use config::shared::ReindexConfig;
use telemetry::init_tracing;
use tracing::error;

use crate::core::start_reindexer_with_config;
use crate::error::ReindexerResult;

mod consumer;
mod core;
mod error;

fn main() -> ReindexerResult<()> {
    let config: ReindexConfig = load_config()?;
    config.validate()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: ReindexConfig) -> ReindexerResult<()> {
    if let Err(err) = start_reindexer_with_config(config).await {
        error!("{err}");
        return Err(err);
    }

    Ok(())
}
