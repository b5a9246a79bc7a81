//! Reconciled state: per-scope and global mirrors of server state.
//!
//! ## State hierarchy
//!
//! ```text
//! SharedGlobal                     SharedScope (one per directory)
//! └── GlobalState                  └── ScopeState
//!     ├── path                         ├── phase (loading/partial/complete)
//!     ├── projects  (Reconciled)       ├── sessions (Reconciled)
//!     ├── providers                    ├── messages/parts (Reconciled per key)
//!     └── provider_auth                ├── permissions (Reconciled per session)
//!                                      └── status/diff/todo/mcp/lsp/vcs maps
//! ```
//!
//! Collections with string ids are kept id-sorted and mutated by binary
//! search. Mutation happens only through [`SharedScope::update`] /
//! [`SharedGlobal::update`], which apply a whole batch under one lock and
//! signal observers once, so a partially applied batch is never visible.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use tether_types::{
    Agent, CommandInfo, EventPayload, FileDiff, Ident, McpStatus, Message, Part, PathInfo,
    PermissionRequest, Project, ProviderList, Session, SessionStatus, Todo, VcsInfo,
};

use crate::error::SyncError;

/// Routing key for a synchronization unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Global,
    Directory(String),
}

impl ScopeKey {
    pub fn from_directory(directory: Option<&str>) -> Self {
        match directory {
            Some(dir) if dir != "global" => ScopeKey::Directory(dir.to_string()),
            _ => ScopeKey::Global,
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeKey::Global => write!(f, "global"),
            ScopeKey::Directory(dir) => write!(f, "{dir}"),
        }
    }
}

/// Bootstrap progress of a scope. Monotonic while the scope is alive;
/// only a disposal reset returns it to `Loading`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    #[default]
    Loading,
    Partial,
    Complete,
}

/// Outcome of the global bootstrap, for the embedding layer's
/// ready/error signal pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum BootstrapStatus {
    #[default]
    Pending,
    Ready,
    Failed(SyncError),
}

/// Id-sorted, id-unique collection mutated via binary search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciled<T> {
    items: Vec<T>,
}

impl<T: Ident + PartialEq> Reconciled<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Builds a collection from unordered input, keeping the last entry
    /// for any duplicated id.
    pub fn from_vec(mut items: Vec<T>) -> Self {
        items.sort_by(|a, b| a.ident().cmp(b.ident()));
        items.reverse();
        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.ident().to_string()));
        items.reverse();
        Self { items }
    }

    /// Inserts or structurally replaces by id. Returns whether anything
    /// changed; replacing with an identical value is a no-op so callers
    /// do not dirty observers for nothing.
    pub fn upsert(&mut self, value: T) -> bool {
        match self
            .items
            .binary_search_by(|item| item.ident().cmp(value.ident()))
        {
            Ok(index) => {
                if self.items[index] == value {
                    false
                } else {
                    self.items[index] = value;
                    true
                }
            }
            Err(index) => {
                self.items.insert(index, value);
                true
            }
        }
    }

    /// Removes by id; absent ids are a no-op.
    pub fn remove(&mut self, id: &str) -> bool {
        match self.items.binary_search_by(|item| item.ident().cmp(id)) {
            Ok(index) => {
                self.items.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items
            .binary_search_by(|item| item.ident().cmp(id))
            .ok()
            .map(|index| &self.items[index])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Replaces the whole collection; returns whether it changed.
    pub fn replace_all(&mut self, items: Vec<T>) -> bool {
        let next = Self::from_vec(items);
        if *self == next {
            false
        } else {
            *self = next;
            true
        }
    }
}

/// Tracks cross-event effects within one atomic batch. A session archived
/// anywhere in the batch wins over any regular update for the same id,
/// regardless of arrival order.
#[derive(Debug, Default)]
pub struct BatchApply {
    archived: HashSet<String>,
}

impl BatchApply {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Mirror of one directory scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeState {
    pub phase: Phase,
    /// Retained error from a failed blocking bootstrap request.
    pub error: Option<SyncError>,
    pub project: String,
    pub providers: ProviderList,
    pub config: Value,
    pub path: PathInfo,
    pub agents: Vec<Agent>,
    pub commands: Vec<CommandInfo>,
    pub sessions: Reconciled<Session>,
    pub session_status: HashMap<String, SessionStatus>,
    pub session_diff: HashMap<String, Vec<FileDiff>>,
    pub todos: HashMap<String, Vec<Todo>>,
    pub permissions: HashMap<String, Reconciled<PermissionRequest>>,
    pub mcp: HashMap<String, McpStatus>,
    pub lsp: Vec<tether_types::LspStatus>,
    pub vcs: Option<VcsInfo>,
    /// Session retention limit for this scope.
    pub limit: usize,
    /// Messages keyed by session id.
    pub messages: HashMap<String, Reconciled<Message>>,
    /// Parts keyed by message id.
    pub parts: HashMap<String, Reconciled<Part>>,
}

impl ScopeState {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    /// Advances the readiness phase; regressions are ignored.
    pub fn advance(&mut self, to: Phase) -> bool {
        if to > self.phase {
            self.phase = to;
            true
        } else {
            false
        }
    }

    /// In-place reset back to `loading`, keeping only the retention
    /// limit. Used when the server disposes the instance behind this
    /// scope.
    pub fn reset(&mut self) {
        *self = Self::new(self.limit);
    }

    /// Applies one event to the mirror. Returns whether anything changed.
    ///
    /// Disposal and `lsp.updated` carry side effects (sequencer restart,
    /// status refetch) that the registry handles; here they are no-ops.
    pub fn apply(&mut self, payload: EventPayload, batch: &mut BatchApply) -> bool {
        match payload {
            EventPayload::SessionUpdated { info } => {
                if info.time.archived.is_some() {
                    batch.archived.insert(info.id.clone());
                    self.drop_session(&info.id)
                } else if batch.archived.contains(&info.id) {
                    false
                } else {
                    self.sessions.upsert(info)
                }
            }
            EventPayload::SessionDiff { session_id, diff } => {
                if self.session_diff.get(&session_id) == Some(&diff) {
                    false
                } else {
                    self.session_diff.insert(session_id, diff);
                    true
                }
            }
            EventPayload::SessionStatusChanged { session_id, status } => match status {
                Some(status) => {
                    if self.session_status.get(&session_id) == Some(&status) {
                        false
                    } else {
                        self.session_status.insert(session_id, status);
                        true
                    }
                }
                None => self.session_status.remove(&session_id).is_some(),
            },
            EventPayload::TodoUpdated { session_id, todos } => {
                if self.todos.get(&session_id) == Some(&todos) {
                    false
                } else {
                    self.todos.insert(session_id, todos);
                    true
                }
            }
            EventPayload::MessageUpdated { info } => self
                .messages
                .entry(info.session_id.clone())
                .or_default()
                .upsert(info),
            EventPayload::MessageRemoved {
                session_id,
                message_id,
            } => self
                .messages
                .get_mut(&session_id)
                .is_some_and(|messages| messages.remove(&message_id)),
            EventPayload::PartUpdated { part } => self
                .parts
                .entry(part.message_id.clone())
                .or_default()
                .upsert(part),
            EventPayload::PartRemoved {
                message_id,
                part_id,
            } => self
                .parts
                .get_mut(&message_id)
                .is_some_and(|parts| parts.remove(&part_id)),
            EventPayload::PermissionAsked { request } => self
                .permissions
                .entry(request.session_id.clone())
                .or_default()
                .upsert(request),
            EventPayload::PermissionReplied {
                session_id,
                request_id,
            } => self
                .permissions
                .get_mut(&session_id)
                .is_some_and(|requests| requests.remove(&request_id)),
            EventPayload::VcsBranchUpdated { branch } => {
                let next = Some(VcsInfo { branch });
                if self.vcs == next {
                    false
                } else {
                    self.vcs = next;
                    true
                }
            }
            // Side effects owned by the registry.
            EventPayload::LspUpdated {} | EventPayload::InstanceDisposed {} => false,
            // Global-family events never reach a directory scope.
            EventPayload::GlobalDisposed {}
            | EventPayload::ProjectUpdated { .. }
            | EventPayload::Unknown => false,
        }
    }

    /// Removes a session and everything keyed by it, as one mutation.
    fn drop_session(&mut self, session_id: &str) -> bool {
        let mut dirty = self.sessions.remove(session_id);
        dirty |= self.session_status.remove(session_id).is_some();
        dirty |= self.session_diff.remove(session_id).is_some();
        dirty |= self.todos.remove(session_id).is_some();
        dirty |= self.permissions.remove(session_id).is_some();
        dirty
    }
}

/// Mirror of the global scope (project/provider registries).
#[derive(Debug, Clone, Default)]
pub struct GlobalState {
    pub path: PathInfo,
    pub projects: Reconciled<Project>,
    pub providers: ProviderList,
    pub provider_auth: HashMap<String, Value>,
}

impl GlobalState {
    /// Applies one global-family event. Returns whether anything changed.
    pub fn apply(&mut self, payload: EventPayload) -> bool {
        match payload {
            EventPayload::ProjectUpdated { project } => self.projects.upsert(project),
            // `global.disposed` triggers a full re-bootstrap; the
            // registry owns that.
            _ => false,
        }
    }
}

/// Handle to one scope's state: locked mutation plus a revision channel
/// that ticks once per applied batch.
#[derive(Clone)]
pub struct SharedScope {
    state: Arc<Mutex<ScopeState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl SharedScope {
    pub fn new(limit: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ScopeState::new(limit))),
            revision: Arc::new(revision),
        }
    }

    /// Reads a consistent snapshot of the state.
    pub fn read<R>(&self, f: impl FnOnce(&ScopeState) -> R) -> R {
        let guard = self.state.lock().expect("scope state lock poisoned");
        f(&guard)
    }

    /// Applies a mutation batch atomically. The closure returns whether
    /// anything changed; observers are signaled at most once per call and
    /// never observe an intermediate state.
    pub fn update(&self, f: impl FnOnce(&mut ScopeState) -> bool) {
        let dirty = {
            let mut guard = self.state.lock().expect("scope state lock poisoned");
            f(&mut guard)
        };
        if dirty {
            self.revision.send_modify(|rev| *rev += 1);
        }
    }

    /// Subscribes to batch notifications.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.subscribe().borrow()
    }
}

/// Handle to the global scope plus the bootstrap ready/error signal.
#[derive(Clone)]
pub struct SharedGlobal {
    state: Arc<Mutex<GlobalState>>,
    revision: Arc<watch::Sender<u64>>,
    status: Arc<watch::Sender<BootstrapStatus>>,
}

impl SharedGlobal {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        let (status, _) = watch::channel(BootstrapStatus::Pending);
        Self {
            state: Arc::new(Mutex::new(GlobalState::default())),
            revision: Arc::new(revision),
            status: Arc::new(status),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&GlobalState) -> R) -> R {
        let guard = self.state.lock().expect("global state lock poisoned");
        f(&guard)
    }

    pub fn update(&self, f: impl FnOnce(&mut GlobalState) -> bool) {
        let dirty = {
            let mut guard = self.state.lock().expect("global state lock poisoned");
            f(&mut guard)
        };
        if dirty {
            self.revision.send_modify(|rev| *rev += 1);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Current bootstrap outcome plus a channel for awaiting changes.
    pub fn status(&self) -> watch::Receiver<BootstrapStatus> {
        self.status.subscribe()
    }

    pub fn mark_pending(&self) {
        self.status.send_replace(BootstrapStatus::Pending);
    }

    pub fn mark_ready(&self) {
        self.status.send_replace(BootstrapStatus::Ready);
    }

    pub fn mark_failed(&self, error: SyncError) {
        self.status.send_replace(BootstrapStatus::Failed(error));
    }
}

impl Default for SharedGlobal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use tether_types::SessionTime;

    use super::*;

    fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            ..Session::default()
        }
    }

    fn archived_session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            time: SessionTime {
                created: 1,
                updated: None,
                archived: Some(2),
            },
            ..Session::default()
        }
    }

    fn assert_sorted(sessions: &Reconciled<Session>) {
        let ids: Vec<_> = sessions.iter().map(|s| s.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted, "collection must stay sorted and unique");
    }

    #[test]
    fn upsert_keeps_collection_sorted() {
        let mut sessions = Reconciled::new();
        for id in ["ses_m", "ses_a", "ses_z", "ses_k", "ses_a"] {
            sessions.upsert(session(id));
            assert_sorted(&sessions);
        }
        assert_eq!(sessions.len(), 4);
    }

    #[test]
    fn sorted_after_any_operation_sequence() {
        // Pseudo-random upsert/remove churn; the sort invariant must hold
        // after every single step.
        let mut sessions = Reconciled::new();
        let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
        for step in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = format!("ses_{:03}", seed % 100);
            if seed % 3 == 0 {
                sessions.remove(&id);
            } else {
                sessions.upsert(session(&id));
            }
            assert_sorted(&sessions);
            let _ = step;
        }
    }

    #[test]
    fn upsert_identical_value_is_clean() {
        let mut sessions = Reconciled::new();
        assert!(sessions.upsert(session("ses_1")));
        assert!(!sessions.upsert(session("ses_1")));
        let mut changed = session("ses_1");
        changed.title = "renamed".into();
        assert!(sessions.upsert(changed));
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut sessions = Reconciled::new();
        sessions.upsert(session("ses_1"));
        assert!(!sessions.remove("ses_0"));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn from_vec_dedups_keeping_last() {
        let mut a = session("ses_1");
        a.title = "first".into();
        let mut b = session("ses_1");
        b.title = "second".into();
        let sessions = Reconciled::from_vec(vec![a, b, session("ses_0")]);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.get("ses_1").unwrap().title, "second");
    }

    #[test]
    fn phase_never_regresses_without_reset() {
        let mut scope = ScopeState::new(5);
        assert!(scope.advance(Phase::Partial));
        assert!(scope.advance(Phase::Complete));
        assert!(!scope.advance(Phase::Partial));
        assert_eq!(scope.phase, Phase::Complete);
        scope.reset();
        assert_eq!(scope.phase, Phase::Loading);
        assert_eq!(scope.limit, 5);
    }

    #[test]
    fn archived_session_removes_and_clears_dependents() {
        let mut scope = ScopeState::new(5);
        let mut batch = BatchApply::new();
        scope.apply(
            EventPayload::SessionUpdated {
                info: session("ses_1"),
            },
            &mut batch,
        );
        scope.apply(
            EventPayload::SessionStatusChanged {
                session_id: "ses_1".into(),
                status: Some(SessionStatus {
                    kind: "working".into(),
                    attributes: serde_json::Map::new(),
                }),
            },
            &mut batch,
        );
        assert!(scope.session_status.contains_key("ses_1"));

        let dirty = scope.apply(
            EventPayload::SessionUpdated {
                info: archived_session("ses_1"),
            },
            &mut batch,
        );
        assert!(dirty);
        assert!(scope.sessions.is_empty());
        assert!(!scope.session_status.contains_key("ses_1"));
    }

    #[test]
    fn archived_wins_within_a_batch_regardless_of_order() {
        let mut scope = ScopeState::new(5);
        let mut batch = BatchApply::new();
        // Archived first, regular update second: the update must not
        // resurrect the session.
        scope.apply(
            EventPayload::SessionUpdated {
                info: archived_session("ses_1"),
            },
            &mut batch,
        );
        let dirty = scope.apply(
            EventPayload::SessionUpdated {
                info: session("ses_1"),
            },
            &mut batch,
        );
        assert!(!dirty);
        assert!(scope.sessions.is_empty());

        // A fresh batch lifts the suppression.
        let mut batch = BatchApply::new();
        assert!(scope.apply(
            EventPayload::SessionUpdated {
                info: session("ses_1"),
            },
            &mut batch,
        ));
        assert!(scope.sessions.contains("ses_1"));
    }

    #[test]
    fn permission_reply_removes_pending_request() {
        let mut scope = ScopeState::new(5);
        let mut batch = BatchApply::new();
        scope.apply(
            EventPayload::PermissionAsked {
                request: PermissionRequest {
                    id: "req_1".into(),
                    session_id: "ses_1".into(),
                    ..PermissionRequest::default()
                },
            },
            &mut batch,
        );
        assert_eq!(scope.permissions["ses_1"].len(), 1);
        scope.apply(
            EventPayload::PermissionReplied {
                session_id: "ses_1".into(),
                request_id: "req_1".into(),
            },
            &mut batch,
        );
        assert!(scope.permissions["ses_1"].is_empty());
    }

    #[test]
    fn part_updates_group_by_message() {
        let mut scope = ScopeState::new(5);
        let mut batch = BatchApply::new();
        let part = Part {
            id: "prt_1".into(),
            message_id: "msg_1".into(),
            ..Part::default()
        };
        assert!(scope.apply(EventPayload::PartUpdated { part: part.clone() }, &mut batch));
        // Same payload again: structurally identical, no dirty.
        assert!(!scope.apply(EventPayload::PartUpdated { part }, &mut batch));
        assert!(scope.apply(
            EventPayload::PartRemoved {
                message_id: "msg_1".into(),
                part_id: "prt_1".into(),
            },
            &mut batch,
        ));
    }

    #[test]
    fn shared_scope_signals_once_per_batch() {
        let scope = SharedScope::new(5);
        let rx = scope.subscribe();
        scope.update(|state| {
            let mut batch = BatchApply::new();
            let mut dirty = false;
            for id in ["ses_1", "ses_2", "ses_3"] {
                dirty |= state.apply(
                    EventPayload::SessionUpdated { info: session(id) },
                    &mut batch,
                );
            }
            dirty
        });
        assert_eq!(*rx.borrow(), 1);
        // A clean batch does not tick the revision.
        scope.update(|_| false);
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn global_project_update_is_binary_upsert() {
        let mut global = GlobalState::default();
        for id in ["prj_b", "prj_a", "prj_c"] {
            global.apply(EventPayload::ProjectUpdated {
                project: Project {
                    id: id.into(),
                    worktree: "/w".into(),
                },
            });
        }
        let ids: Vec<_> = global.projects.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["prj_a", "prj_b", "prj_c"]);
    }
}
