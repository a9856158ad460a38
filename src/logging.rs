//! Logging initialization using tracing.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. The configured level is the default
/// directive; `RUST_LOG` still takes precedence for targeted filtering.
pub fn init(level: &str, format: &str) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            level
                .parse()
                .map_err(|_| anyhow!("invalid log level '{level}'"))?,
        )
        .from_env_lossy();

    match format {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .with_current_span(true)
                .with_target(true)
                .init();
        }
        "pretty" => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
        other => return Err(anyhow!("invalid log format '{other}'")),
    }

    Ok(())
}
