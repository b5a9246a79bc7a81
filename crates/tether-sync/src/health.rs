//! Liveness gate ahead of the global bootstrap.

use tokio::time::Instant;
use tracing::debug;

use crate::client::ServerClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncErrorKind, SyncResult};

/// Polls the liveness endpoint until the server reports healthy, at a
/// fixed interval, up to the configured total-wait ceiling. Each attempt
/// has its own timeout. Exits on the first healthy response.
///
/// # Errors
/// `HealthCheck` once the ceiling elapses, carrying the last observed
/// transport error when one occurred; `Cancelled` if shut down mid-wait.
pub async fn wait_healthy(client: &ServerClient, config: &SyncConfig) -> SyncResult<()> {
    let cancel = client.cancellation();
    let deadline = Instant::now() + config.health_max_wait();
    let mut last_error: Option<SyncError> = None;
    let mut attempts: u32 = 0;

    while Instant::now() < deadline {
        attempts += 1;
        match client.health(config.health_attempt_timeout()).await {
            Ok(true) => {
                debug!(attempts, "server healthy");
                return Ok(());
            }
            Ok(false) => {
                debug!(attempts, "server reachable but not healthy yet");
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                debug!(attempts, error = %err, "health probe failed");
                last_error = Some(err);
            }
        }

        tokio::select! {
            () = cancel.cancelled() => return Err(SyncError::cancelled("health poll")),
            () = tokio::time::sleep(config.health_interval()) => {}
        }
    }

    Err(match last_error {
        Some(err) => SyncError::new(
            SyncErrorKind::HealthCheck,
            format!("server not healthy after {attempts} attempts: {err}"),
        )
        .with_details(err.message),
        None => SyncError::new(
            SyncErrorKind::HealthCheck,
            format!("server did not become healthy after {attempts} attempts"),
        ),
    })
}
