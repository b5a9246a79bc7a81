//! Client-side synchronization engine (transport, coalescing, scopes).

pub mod bootstrap;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod health;
pub mod registry;
pub mod retry;
pub mod store;

pub use config::{ConcurrencyMode, SyncConfig};
pub use error::{SyncError, SyncErrorKind, SyncResult};
pub use registry::SyncEngine;
pub use store::{BootstrapStatus, Phase, Reconciled, ScopeKey, SharedGlobal, SharedScope};
