//! cmdbridge host — executor side of the bridge, served over stdio
//!
//! Reads call frames from stdin, writes reply and progress frames to
//! stdout. Logs go to stderr so they never mix with frames. When stdin
//! closes, every process still running is killed and the host exits.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cmdbridge::{config, Executor, SystemProcessTree};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    init_logging(&config.host.log_level)?;

    info!("cmdbridge host v{} starting...", env!("CARGO_PKG_VERSION"));

    let executor = Arc::new(Executor::new(
        &config.executor,
        Arc::new(SystemProcessTree),
    ));

    cmdbridge::transport::serve(executor, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Host transport failed")?;

    info!("Caller went away, host exiting");
    Ok(())
}

/// `RUST_LOG` wins over `host.log_level`
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .compact()
        .init();
    Ok(())
}
