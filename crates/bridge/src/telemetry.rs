//! Tracing installation for embedding hosts.

use anyhow::{anyhow, Result};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install the global tracing subscriber: an env-filtered fmt layer, `info`
/// by default. Returns an error if a subscriber is already installed, which
/// makes repeated calls from the host harmless.
pub fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
