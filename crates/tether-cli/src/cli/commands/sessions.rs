//! Lists the retained sessions for a directory scope.

use anyhow::{Context, Result};
use tether_sync::{Phase, SyncConfig, SyncEngine};
use tracing::warn;

pub async fn run(config: SyncConfig, directory: &str, json: bool) -> Result<()> {
    let ceiling = config.bootstrap_ceiling();
    let engine = SyncEngine::new(config).context("build sync engine")?;
    let scope = engine.scope(directory);
    let mut revisions = scope.subscribe();

    // Sessions arrive with the enrichment set, so wait for the scope to
    // finish its bootstrap.
    let complete = async {
        while scope.read(|state| state.phase) != Phase::Complete {
            if revisions.changed().await.is_err() {
                break;
            }
        }
    };
    tokio::time::timeout(ceiling, complete)
        .await
        .context("scope bootstrap timed out")?;
    engine.shutdown();

    if let Some(err) = scope.read(|state| state.error.clone()) {
        warn!(error = %err, "scope is only partially synchronized");
    }

    let sessions = scope.read(|state| state.sessions.as_slice().to_vec());
    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else if sessions.is_empty() {
        println!("no sessions retained for {directory}");
    } else {
        for session in &sessions {
            println!("{}\t{}", session.id, session.title);
        }
    }
    Ok(())
}
