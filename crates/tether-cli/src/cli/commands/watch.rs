//! Live state observer for one directory scope.

use anyhow::{Context, Result};
use tether_sync::store::ScopeState;
use tether_sync::{SyncConfig, SyncEngine};

pub async fn run(config: SyncConfig, directory: &str) -> Result<()> {
    let engine = SyncEngine::new(config).context("build sync engine")?;
    let scope = engine.scope(directory);
    let mut revisions = scope.subscribe();

    let mut pump = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    println!("watching {directory}");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                engine.shutdown();
                break;
            }
            // Exit when the server ends the stream instead of idling on a
            // dead subscription.
            result = &mut pump => return finish(result),
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", scope.read(summarize));
            }
        }
    }

    finish(pump.await)
}

fn finish(result: Result<tether_sync::SyncResult<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err).context("event stream"),
        Err(err) => Err(err).context("engine task"),
    }
}

fn summarize(state: &ScopeState) -> String {
    let busy = state
        .session_status
        .values()
        .filter(|status| status.kind != "idle")
        .count();
    let pending: usize = state.permissions.values().map(|group| group.len()).sum();
    let branch = state
        .vcs
        .as_ref()
        .map_or("-", |vcs| vcs.branch.as_str());
    format!(
        "phase={:?} sessions={} busy={busy} pending_permissions={pending} branch={branch}",
        state.phase,
        state.sessions.len(),
    )
}
