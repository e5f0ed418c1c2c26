pub mod bandwidth;
pub mod error;
pub mod traffic;

pub use bandwidth::{BandwidthLimiter, BurstBand};
pub use error::{CommonError, Result};
pub use traffic::Traffic;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber. `RUST_LOG` wins over `log_level`.
///
/// With a `log_dir` the output goes to a daily rolling file and the returned
/// guard must be kept alive for the lifetime of the process.
pub fn init_tracing(
    log_dir: Option<&str>,
    log_file: &str,
    log_level: &str,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| CommonError::Config(format!("invalid log_level '{}': {}", log_level, e)))?;

    if let Some(log_dir) = log_dir {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_ansi(false),
            )
            .try_init()
            .map_err(|e| CommonError::Config(e.to_string()))?;
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_ansi(true),
            )
            .try_init()
            .map_err(|e| CommonError::Config(e.to_string()))?;
        Ok(None)
    }
}
