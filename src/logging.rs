//! Tracing subscriber setup for the launcher.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over `level` when it is set, so a single unit can be turned
/// up with e.g. `RUST_LOG=closed_loop_rig::tracking=trace`.
pub fn init(level: &str) -> Result<()> {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives)
            .with_context(|| format!("Invalid {} directives", EnvFilter::DEFAULT_ENV))?,
        _ => build_filter(level)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(format!("closed_loop_rig={level},rig={level},warn"))
        .with_context(|| format!("Invalid log level '{level}'"))
}
