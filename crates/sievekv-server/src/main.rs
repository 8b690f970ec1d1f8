//! Replica daemon entry point: environment bootstrap, tracing, run until
//! CLOSE.

use anyhow::Context;

use sievekv_config::Bootstrap;
use sievekv_server::{Replica, RuntimeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bootstrap = Bootstrap::from_env().context("loading cluster bootstrap")?;
    tracing::info!(
        pid = %bootstrap.process_id,
        n = bootstrap.n_processes,
        faulty = bootstrap.faulty,
        "starting sieve replica"
    );

    let replica = Replica::spawn(&bootstrap, RuntimeConfig::default())
        .await
        .context("spawning replica runtime")?;
    replica.join().await.context("replica runtime failed")?;

    tracing::info!("replica stopped");
    Ok(())
}
