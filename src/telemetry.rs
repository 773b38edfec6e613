// telemetry.rs - tracing subscriber setup
use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Overrides the configured level with a full filter directive, e.g.
/// `QCLUSTER_LOG=qcluster::worker=debug,info`
pub const LOG_FILTER_ENV: &str = "QCLUSTER_LOG";

/// Install the global subscriber. Logs go to stderr so stdout stays free
/// for command output.
pub fn init(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV)
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("Invalid log level {:?}: {}", level, e))?;

    let registry = Registry::default().with(filter);
    let installed = if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_current_span(true),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .try_init()
    };

    installed.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}
