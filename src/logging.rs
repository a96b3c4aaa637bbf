//! Optional logging setup using `tracing` + `tracing-subscriber`.
//!
//! Hosts embedding the library usually install their own subscriber; this
//! module is for binaries that just want sensible output. The log level
//! comes from the `KARAKURI_LOG` environment variable (e.g. "info",
//! "debug") and defaults to `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global subscriber with progress-bar aware output.
///
/// Log lines are routed above the progress bars drawn by the build driver
/// instead of tearing through them. Fails if a global subscriber is
/// already set.
pub fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("KARAKURI_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let indicatif = tracing_indicatif::IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(indicatif.get_stderr_writer())
                .with_target(false),
        )
        .with(indicatif)
        .try_init()?;

    Ok(())
}
