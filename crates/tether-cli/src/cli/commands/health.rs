//! One-shot liveness probe.

use anyhow::{bail, Context, Result};
use tether_sync::client::ServerClient;
use tether_sync::SyncConfig;
use tokio_util::sync::CancellationToken;

pub async fn run(config: SyncConfig) -> Result<()> {
    let client =
        ServerClient::new(&config, CancellationToken::new()).context("build server client")?;
    match client.health(config.health_attempt_timeout()).await {
        Ok(true) => {
            println!("{} is healthy", config.endpoint);
            Ok(())
        }
        Ok(false) => bail!("{} responded but reports unhealthy", config.endpoint),
        Err(err) => {
            Err(err).with_context(|| format!("{} is unreachable", config.endpoint))
        }
    }
}
