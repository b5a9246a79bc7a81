//! Phased acquisition of a scope's initial state.
//!
//! Blocking requests must settle before the scope is usable (`partial`);
//! non-blocking requests enrich it afterwards (`complete`). Every request
//! goes through the shared retry policy. A blocking failure is retained
//! on the scope but never aborts its siblings; a non-blocking failure is
//! logged and forgotten.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;
use tracing::{debug, error, warn};

use tether_types::{
    Agent, CommandInfo, LspStatus, McpStatus, PathInfo, PermissionRequest, ProviderList, Session,
    SessionStatus, VcsInfo,
};

use crate::client::ServerClient;
use crate::config::{ConcurrencyMode, SyncConfig};
use crate::error::SyncResult;
use crate::store::{Phase, Reconciled, SharedScope};

/// Upper bound on concurrently in-flight blocking requests.
const BLOCKING_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockingRequest {
    Project,
    Providers,
    Agents,
    Config,
}

impl BlockingRequest {
    const ALL: [Self; 4] = [Self::Project, Self::Providers, Self::Agents, Self::Config];

    fn name(self) -> &'static str {
        match self {
            Self::Project => "project.current",
            Self::Providers => "provider.list",
            Self::Agents => "agent.list",
            Self::Config => "config.get",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnrichmentRequest {
    Path,
    Commands,
    SessionStatus,
    Sessions,
    Mcp,
    Lsp,
    Vcs,
    Permissions,
}

impl EnrichmentRequest {
    const ALL: [Self; 8] = [
        Self::Path,
        Self::Commands,
        Self::SessionStatus,
        Self::Sessions,
        Self::Mcp,
        Self::Lsp,
        Self::Vcs,
        Self::Permissions,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Path => "path.get",
            Self::Commands => "command.list",
            Self::SessionStatus => "session.status",
            Self::Sessions => "session.list",
            Self::Mcp => "mcp.status",
            Self::Lsp => "lsp.status",
            Self::Vcs => "vcs.get",
            Self::Permissions => "permission.list",
        }
    }
}

/// Runs the full bootstrap sequence for one scope.
///
/// Call again after a disposal reset to restart the sequence; phase
/// monotonicity is enforced by the store.
pub async fn run_scope(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) {
    debug!(directory, "scope bootstrap starting");

    let mut blocking: FuturesUnordered<_> = FuturesUnordered::new();
    let mut pending = BlockingRequest::ALL.iter();
    // Keep a bounded number in flight; top up as requests settle.
    for request in pending.by_ref().take(BLOCKING_CONCURRENCY) {
        blocking.push(fetch_blocking(client, config, scope, directory, *request));
    }
    while let Some((request, result)) = blocking.next().await {
        if let Err(err) = result {
            if err.is_cancelled() {
                return;
            }
            error!(directory, request = request.name(), error = %err, "blocking bootstrap request failed");
            scope.update(|state| {
                state.error = Some(err.clone());
                true
            });
        }
        if let Some(next) = pending.next() {
            blocking.push(fetch_blocking(client, config, scope, directory, *next));
        }
    }

    // Degraded state is still usable state.
    scope.update(|state| state.advance(Phase::Partial));
    debug!(directory, "scope bootstrap partial");

    let enrichment = EnrichmentRequest::ALL;
    match config.concurrency {
        ConcurrencyMode::Concurrent => {
            let mut settled = futures_util::stream::iter(enrichment)
                .map(|request| fetch_enrichment(client, config, scope, directory, request))
                .buffer_unordered(enrichment.len());
            while let Some(cancelled) = settled.next().await {
                if cancelled {
                    return;
                }
            }
        }
        ConcurrencyMode::Sequential => {
            for request in enrichment {
                if fetch_enrichment(client, config, scope, directory, request).await {
                    return;
                }
            }
        }
    }

    scope.update(|state| state.advance(Phase::Complete));
    debug!(directory, "scope bootstrap complete");
}

async fn fetch_blocking(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
    request: BlockingRequest,
) -> (BlockingRequest, SyncResult<()>) {
    let policy = config.retry_policy();
    let timeout = config.request_timeout();
    let name = request.name();
    let result = match request {
        BlockingRequest::Project => policy
            .run(name, || {
                client.get_json::<tether_types::Project>("/project/current", Some(directory), timeout)
            })
            .await
            .map(|project| {
                scope.update(|state| {
                    state.project = project.id.clone();
                    true
                });
            }),
        BlockingRequest::Providers => policy
            .run(name, || {
                client.get_json::<ProviderList>("/provider", Some(directory), timeout)
            })
            .await
            .map(|mut providers| {
                providers.retain_supported_models();
                scope.update(|state| {
                    state.providers = providers;
                    true
                });
            }),
        BlockingRequest::Agents => policy
            .run(name, || {
                client.get_json::<Vec<Agent>>("/agent", Some(directory), timeout)
            })
            .await
            .map(|agents| {
                scope.update(|state| {
                    state.agents = agents;
                    true
                });
            }),
        BlockingRequest::Config => policy
            .run(name, || {
                client.get_json::<Value>("/config", Some(directory), timeout)
            })
            .await
            .map(|value| {
                scope.update(|state| {
                    state.config = value;
                    true
                });
            }),
    };
    (request, result)
}

/// Runs one non-blocking request; failures are logged, not propagated.
/// Returns `true` only when cancelled, so the sequencer can stop.
async fn fetch_enrichment(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
    request: EnrichmentRequest,
) -> bool {
    let result = match request {
        EnrichmentRequest::Path => fetch_path(client, config, scope, directory).await,
        EnrichmentRequest::Commands => fetch_commands(client, config, scope, directory).await,
        EnrichmentRequest::SessionStatus => {
            fetch_session_status(client, config, scope, directory).await
        }
        EnrichmentRequest::Sessions => fetch_sessions(client, config, scope, directory).await,
        EnrichmentRequest::Mcp => fetch_mcp(client, config, scope, directory).await,
        EnrichmentRequest::Lsp => refetch_lsp(client, config, scope, directory).await,
        EnrichmentRequest::Vcs => fetch_vcs(client, config, scope, directory).await,
        EnrichmentRequest::Permissions => fetch_permissions(client, config, scope, directory).await,
    };
    match result {
        Ok(()) => false,
        Err(err) if err.is_cancelled() => true,
        Err(err) => {
            // Affected field keeps its prior value.
            warn!(directory, request = request.name(), error = %err, "non-blocking bootstrap request failed");
            false
        }
    }
}

async fn fetch_path(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let path = config
        .retry_policy()
        .run("path.get", || {
            client.get_json::<PathInfo>("/path", Some(directory), config.request_timeout())
        })
        .await?;
    scope.update(|state| {
        state.path = path;
        true
    });
    Ok(())
}

async fn fetch_commands(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let commands = config
        .retry_policy()
        .run("command.list", || {
            client.get_json::<Vec<CommandInfo>>("/command", Some(directory), config.request_timeout())
        })
        .await?;
    scope.update(|state| {
        state.commands = commands;
        true
    });
    Ok(())
}

async fn fetch_session_status(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let status = config
        .retry_policy()
        .run("session.status", || {
            client.get_json::<HashMap<String, SessionStatus>>(
                "/session/status",
                Some(directory),
                config.request_timeout(),
            )
        })
        .await?;
    scope.update(|state| {
        state.session_status = status;
        true
    });
    Ok(())
}

/// Fetches the session list and applies the retention policy.
pub async fn fetch_sessions(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let sessions = config
        .retry_policy()
        .run("session.list", || {
            client.get_json::<Vec<Session>>("/session", Some(directory), config.request_timeout())
        })
        .await?;
    let limit = scope.read(|state| state.limit);
    let now_ms = chrono::Utc::now().timestamp_millis();
    let kept = retain_sessions(sessions, limit, config.session_window(), now_ms);
    scope.update(|state| state.sessions.replace_all(kept));
    Ok(())
}

async fn fetch_mcp(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let mcp = config
        .retry_policy()
        .run("mcp.status", || {
            client.get_json::<HashMap<String, McpStatus>>(
                "/mcp",
                Some(directory),
                config.request_timeout(),
            )
        })
        .await?;
    scope.update(|state| {
        state.mcp = mcp;
        true
    });
    Ok(())
}

/// Replaces the scope's diagnostic status list wholesale. Also used by
/// the registry when an `lsp.updated` event arrives.
pub async fn refetch_lsp(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let lsp = config
        .retry_policy()
        .run("lsp.status", || {
            client.get_json::<Vec<LspStatus>>("/lsp", Some(directory), config.request_timeout())
        })
        .await?;
    scope.update(|state| {
        if state.lsp == lsp {
            false
        } else {
            state.lsp = lsp;
            true
        }
    });
    Ok(())
}

async fn fetch_vcs(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let vcs = config
        .retry_policy()
        .run("vcs.get", || {
            client.get_json::<Option<VcsInfo>>("/vcs", Some(directory), config.request_timeout())
        })
        .await?;
    scope.update(|state| {
        state.vcs = vcs;
        true
    });
    Ok(())
}

async fn fetch_permissions(
    client: &ServerClient,
    config: &SyncConfig,
    scope: &SharedScope,
    directory: &str,
) -> SyncResult<()> {
    let requests = config
        .retry_policy()
        .run("permission.list", || {
            client.get_json::<Vec<PermissionRequest>>(
                "/permission",
                Some(directory),
                config.request_timeout(),
            )
        })
        .await?;
    let grouped = group_permissions(requests);
    scope.update(|state| {
        // Sessions the server no longer reports pending requests for are
        // cleared, not left stale.
        let stale: Vec<String> = state
            .permissions
            .keys()
            .filter(|session_id| !grouped.contains_key(*session_id))
            .cloned()
            .collect();
        for session_id in stale {
            state.permissions.insert(session_id, Reconciled::new());
        }
        for (session_id, requests) in grouped {
            state
                .permissions
                .insert(session_id, Reconciled::from_vec(requests));
        }
        true
    });
    Ok(())
}

/// Groups pending permission requests by session, dropping malformed
/// entries with missing ids.
fn group_permissions(
    requests: Vec<PermissionRequest>,
) -> HashMap<String, Vec<PermissionRequest>> {
    let mut grouped: HashMap<String, Vec<PermissionRequest>> = HashMap::new();
    for request in requests {
        if request.id.is_empty() || request.session_id.is_empty() {
            continue;
        }
        grouped
            .entry(request.session_id.clone())
            .or_default()
            .push(request);
    }
    grouped
}

/// Retention policy: from non-archived sessions sorted by id, keep the
/// first `limit` plus any with activity inside the trailing window.
fn retain_sessions(
    sessions: Vec<Session>,
    limit: usize,
    window: Duration,
    now_ms: i64,
) -> Vec<Session> {
    let cutoff = now_ms.saturating_sub(window.as_millis() as i64);
    let mut sessions: Vec<Session> = sessions
        .into_iter()
        .filter(|session| !session.id.is_empty() && session.time.archived.is_none())
        .collect();
    sessions.sort_by(|a, b| a.id.cmp(&b.id));
    sessions
        .into_iter()
        .enumerate()
        .filter(|(index, session)| *index < limit || session.time.last_active() > cutoff)
        .map(|(_, session)| session)
        .collect()
}

#[cfg(test)]
mod tests {
    use tether_types::SessionTime;

    use super::*;

    fn session_at(id: &str, updated: i64) -> Session {
        Session {
            id: id.to_string(),
            time: SessionTime {
                created: 1,
                updated: Some(updated),
                archived: None,
            },
            ..Session::default()
        }
    }

    #[test]
    fn retention_keeps_limit_plus_recent() {
        let now = 10_000_000;
        let window = Duration::from_millis(1_000);
        let mut sessions = Vec::new();
        for i in 0..50 {
            // Stale by default.
            sessions.push(session_at(&format!("ses_{i:03}"), now - 5_000));
        }
        // Three beyond the limit are recently active.
        sessions[10] = session_at("ses_010", now - 100);
        sessions[20] = session_at("ses_020", now - 200);
        sessions[49] = session_at("ses_049", now - 300);

        let kept = retain_sessions(sessions, 5, window, now);
        let ids: Vec<_> = kept.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(kept.len(), 8, "five head entries plus three recent");
        assert_eq!(
            ids,
            vec![
                "ses_000", "ses_001", "ses_002", "ses_003", "ses_004", "ses_010", "ses_020",
                "ses_049"
            ]
        );
    }

    #[test]
    fn retention_drops_archived_and_idless() {
        let now = 10_000;
        let mut archived = session_at("ses_a", now);
        archived.time.archived = Some(now);
        let nameless = session_at("", now);
        let keep = session_at("ses_b", now);
        let kept = retain_sessions(
            vec![archived, nameless, keep],
            5,
            Duration::from_millis(1_000),
            now,
        );
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "ses_b");
    }

    #[test]
    fn retention_falls_back_to_created_time() {
        let now = 10_000;
        let mut session = session_at("ses_z", 0);
        session.time.updated = None;
        session.time.created = now - 10;
        let kept = retain_sessions(vec![session], 0, Duration::from_millis(1_000), now);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn grouping_drops_malformed_requests() {
        let valid = PermissionRequest {
            id: "req_1".into(),
            session_id: "ses_1".into(),
            ..PermissionRequest::default()
        };
        let missing_session = PermissionRequest {
            id: "req_2".into(),
            ..PermissionRequest::default()
        };
        let grouped = group_permissions(vec![valid, missing_session]);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped["ses_1"].len(), 1);
    }
}
