//! Tracing setup shared by the reindex binaries and tests.

use std::sync::Once;

use config::environment::Environment;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_log::log::SetLoggerError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Filter used when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "info";

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to install the log bridge: {0}")]
    LogTracer(#[from] SetLoggerError),

    #[error("failed to set the global tracing subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),

    #[error("failed to determine the runtime environment: {0}")]
    Environment(#[from] std::io::Error),
}

/// Flushes buffered log lines when dropped. Keep it alive for the lifetime of `main`.
#[must_use = "dropping the flusher stops log output"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global tracing subscriber for `app_name`.
///
/// Production emits JSON lines, development emits human readable lines. Output goes through a
/// non-blocking writer and `log` records are forwarded into `tracing`.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;
    LogTracer::init()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    if environment.is_prod() {
        let subscriber = Registry::default().with(filter).with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_writer(writer),
        );
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().with_writer(writer));
        tracing::subscriber::set_global_default(subscriber)?;
    }

    tracing::info!(app = app_name, environment = %environment, "tracing initialized");

    Ok(LogFlusher { _guard: guard })
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a test writer subscriber once per test binary when `ENABLE_TRACING` is set.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var("ENABLE_TRACING").is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().with_test_writer());

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}
