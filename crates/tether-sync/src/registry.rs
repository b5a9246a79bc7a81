//! Scope registry and engine loop.
//!
//! One engine task consumes the event stream through the coalescer and
//! dispatches each flushed batch to the scope it names; per-scope
//! bootstrap sequencers run as spawned tasks whose only shared state is
//! the scope they populate. The registry is the single owner of the
//! scope map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use tether_types::{EventPayload, PathInfo, Project, ProviderList};

use crate::bootstrap;
use crate::client::ServerClient;
use crate::coalesce::{Coalescer, QueuedEvent};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::health;
use crate::store::{BatchApply, BootstrapStatus, ScopeKey, SharedGlobal, SharedScope};

/// Client-side synchronization engine: one per server endpoint.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Registry>,
}

impl SyncEngine {
    /// Builds an engine for the configured endpoint. Nothing runs until
    /// [`SyncEngine::run`] is awaited.
    ///
    /// # Errors
    /// Returns an error if the endpoint URL is unusable.
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let cancel = CancellationToken::new();
        let client = ServerClient::new(&config, cancel.clone())?;
        Ok(Self {
            inner: Arc::new(Registry {
                client,
                config,
                global: SharedGlobal::new(),
                scopes: Mutex::new(HashMap::new()),
                cancel,
            }),
        })
    }

    /// The global scope (project/provider registries).
    pub fn global(&self) -> SharedGlobal {
        self.inner.global.clone()
    }

    /// The scope for a directory, created and bootstrapped on first
    /// reference.
    pub fn scope(&self, directory: &str) -> SharedScope {
        self.inner.scope(directory)
    }

    /// Ready/error signal pair for the global bootstrap outcome.
    pub fn status(&self) -> watch::Receiver<BootstrapStatus> {
        self.inner.global.status()
    }

    /// Forces a full global resynchronization (health gate included).
    pub fn bootstrap(&self) {
        self.inner.spawn_global_bootstrap();
    }

    /// Stops the engine. The event pump exits silently; in-flight
    /// requests observe the cancellation token.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Drives the engine: global bootstrap (gated on liveness, bounded by
    /// the fallback ceiling) plus the event pump. Returns when the stream
    /// ends or the engine is shut down; shutdown is not an error.
    ///
    /// # Errors
    /// Returns an error if the event stream cannot be established.
    pub async fn run(&self) -> SyncResult<()> {
        self.inner.spawn_global_bootstrap();
        self.inner.spawn_bootstrap_ceiling();
        Registry::pump(Arc::clone(&self.inner)).await
    }
}

struct Registry {
    client: ServerClient,
    config: SyncConfig,
    global: SharedGlobal,
    scopes: Mutex<HashMap<String, SharedScope>>,
    cancel: CancellationToken,
}

impl Registry {
    /// Memoized scope lookup; first access starts the scope's bootstrap
    /// sequencer.
    fn scope(self: &Arc<Self>, directory: &str) -> SharedScope {
        let existing = {
            let scopes = self.scopes.lock().expect("scope map lock poisoned");
            scopes.get(directory).cloned()
        };
        if let Some(scope) = existing {
            return scope;
        }
        let scope = SharedScope::new(self.config.session_limit);
        {
            let mut scopes = self.scopes.lock().expect("scope map lock poisoned");
            scopes.insert(directory.to_string(), scope.clone());
        }
        self.spawn_scope_bootstrap(directory.to_string(), scope.clone());
        scope
    }

    fn spawn_scope_bootstrap(self: &Arc<Self>, directory: String, scope: SharedScope) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            bootstrap::run_scope(&registry.client, &registry.config, &scope, &directory).await;
        });
    }

    fn spawn_global_bootstrap(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.run_global_bootstrap().await;
        });
    }

    /// Fallback ceiling on the whole global bootstrap: if it has neither
    /// succeeded nor recorded an explicit failure when the ceiling
    /// elapses, force a terminal error instead of an indefinite loading
    /// state.
    fn spawn_bootstrap_ceiling(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = registry.cancel.cancelled() => {}
                () = tokio::time::sleep(registry.config.bootstrap_ceiling()) => {
                    let pending =
                        *registry.global.status().borrow() == BootstrapStatus::Pending;
                    if pending {
                        error!("global bootstrap did not complete within the ceiling");
                        registry.global.mark_failed(SyncError::timeout(
                            "initialization timed out; check server connectivity and retry",
                        ));
                    }
                }
            }
        });
    }

    async fn run_global_bootstrap(&self) {
        self.global.mark_pending();

        match health::wait_healthy(&self.client, &self.config).await {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                error!(error = %err, "health gate failed");
                self.global.mark_failed(err);
                return;
            }
        }

        let policy = self.config.retry_policy();
        let timeout = self.config.request_timeout();
        let (path, projects, providers, auth) = tokio::join!(
            policy.run("path.get", || self
                .client
                .get_json::<PathInfo>("/path", None, timeout)),
            policy.run("project.list", || self
                .client
                .get_json::<Vec<Project>>("/project", None, timeout)),
            policy.run("provider.list", || self
                .client
                .get_json::<ProviderList>("/provider", None, timeout)),
            policy.run("provider.auth", || self
                .client
                .get_json::<HashMap<String, Value>>("/provider/auth", None, timeout)),
        );

        match projects {
            Ok(list) => {
                let projects: Vec<Project> = list
                    .into_iter()
                    .filter(|project| !project.id.is_empty() && !project.worktree.is_empty())
                    .collect();
                self.global.update(|state| state.projects.replace_all(projects));
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) => warn!(error = %err, "project list fetch failed"),
        }
        match providers {
            Ok(mut list) => {
                list.retain_supported_models();
                self.global.update(|state| {
                    state.providers = list;
                    true
                });
            }
            Err(err) if err.is_cancelled() => return,
            Err(err) => warn!(error = %err, "provider list fetch failed"),
        }
        match auth {
            Ok(map) => self.global.update(|state| {
                state.provider_auth = map;
                true
            }),
            Err(err) if err.is_cancelled() => return,
            Err(err) => warn!(error = %err, "provider auth fetch failed"),
        }

        // Path resolution is the one critical global fetch.
        match path {
            Ok(info) => {
                self.global.update(|state| {
                    state.path = info;
                    true
                });
                self.global.mark_ready();
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                error!(error = %err, "critical path fetch failed");
                self.global.mark_failed(err);
            }
        }
    }

    /// The single cooperative loop: consume, coalesce, flush, dispatch.
    async fn pump(registry: Arc<Self>) -> SyncResult<()> {
        let mut stream = match registry.client.events().await {
            Ok(stream) => stream,
            Err(err) if err.is_cancelled() => return Ok(()),
            Err(err) => {
                registry.global.mark_failed(err.clone());
                return Err(err);
            }
        };
        debug!("event stream connected");

        let mut coalescer = Coalescer::new(registry.config.flush_interval());
        let yield_budget = registry.config.yield_interval();
        let mut worked_since = Instant::now();

        loop {
            tokio::select! {
                () = registry.cancel.cancelled() => {
                    // Silent exit; no further flushes for this connection.
                    return Ok(());
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        let scope = ScopeKey::from_directory(event.directory.as_deref());
                        coalescer.push(scope, event.payload);
                        // Keep other cooperative tasks fed during bursts.
                        if worked_since.elapsed() >= yield_budget {
                            worked_since = Instant::now();
                            tokio::task::yield_now().await;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "event stream error");
                    }
                    None => {
                        registry.dispatch(coalescer.take());
                        debug!("event stream ended");
                        return Ok(());
                    }
                },
                () = tokio::time::sleep(coalescer.next_flush_delay()), if !coalescer.is_empty() => {
                    registry.dispatch(coalescer.take());
                    worked_since = Instant::now();
                }
            }
        }
    }

    /// Routes one flushed batch, applying each scope's slice atomically.
    fn dispatch(self: &Arc<Self>, batch: Vec<QueuedEvent>) {
        if batch.is_empty() {
            return;
        }
        let mut order: Vec<ScopeKey> = Vec::new();
        let mut grouped: HashMap<ScopeKey, Vec<EventPayload>> = HashMap::new();
        for event in batch {
            let slot = grouped.entry(event.scope.clone()).or_insert_with(|| {
                order.push(event.scope.clone());
                Vec::new()
            });
            slot.push(event.payload);
        }
        for key in order {
            let Some(events) = grouped.remove(&key) else {
                continue;
            };
            match key {
                ScopeKey::Global => self.apply_global(events),
                ScopeKey::Directory(directory) => self.apply_scope(&directory, events),
            }
        }
    }

    fn apply_global(self: &Arc<Self>, events: Vec<EventPayload>) {
        let mut rebootstrap = false;
        self.global.update(|state| {
            let mut dirty = false;
            for event in events {
                match event {
                    EventPayload::GlobalDisposed {} => rebootstrap = true,
                    EventPayload::Unknown => {
                        debug!("ignoring unrecognized global event");
                    }
                    other => dirty |= state.apply(other),
                }
            }
            dirty
        });
        if rebootstrap {
            debug!("global disposed; rebuilding global scope");
            self.spawn_global_bootstrap();
        }
    }

    fn apply_scope(self: &Arc<Self>, directory: &str, events: Vec<EventPayload>) {
        let scope = self.scope(directory);
        let mut restart = false;
        let mut refetch_lsp = false;
        scope.update(|state| {
            let mut dirty = false;
            let mut batch = BatchApply::new();
            for event in events {
                match event {
                    EventPayload::InstanceDisposed {} => {
                        state.reset();
                        dirty = true;
                        restart = true;
                    }
                    EventPayload::LspUpdated {} => refetch_lsp = true,
                    EventPayload::Unknown => {
                        debug!(directory, "ignoring unrecognized event");
                    }
                    other => dirty |= state.apply(other, &mut batch),
                }
            }
            dirty
        });
        if restart {
            debug!(directory, "server instance disposed; restarting scope bootstrap");
            self.spawn_scope_bootstrap(directory.to_string(), scope.clone());
        }
        if refetch_lsp {
            let registry = Arc::clone(self);
            let directory = directory.to_string();
            tokio::spawn(async move {
                let result = bootstrap::refetch_lsp(
                    &registry.client,
                    &registry.config,
                    &scope,
                    &directory,
                )
                .await;
                if let Err(err) = result
                    && !err.is_cancelled()
                {
                    warn!(directory, error = %err, "lsp status refetch failed");
                }
            });
        }
    }
}
