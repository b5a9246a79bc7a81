//! Engine configuration.
//!
//! Loadable from a TOML file with sensible defaults, or constructed
//! programmatically by the embedding application. Missing file means
//! defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// How the non-blocking bootstrap phase issues its requests.
///
/// Some embedding environments mishandle parallel in-flight requests;
/// those set `Sequential`. Everything else should keep the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyMode {
    #[default]
    Concurrent,
    Sequential,
}

/// Retry/backoff knobs applied to bootstrap requests and health polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

/// Liveness gate knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Delay between poll attempts.
    pub interval_ms: u64,
    /// Ceiling on the total wait before the gate fails.
    pub max_wait_ms: u64,
    /// Budget for each individual probe.
    pub attempt_timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_wait_ms: 15_000,
            attempt_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the server, e.g. `http://127.0.0.1:4096`.
    pub endpoint: String,
    /// Per-request budget for bootstrap fetches.
    pub request_timeout_ms: u64,
    pub retry: RetrySettings,
    pub health: HealthSettings,
    /// Outer fallback ceiling covering the health gate plus the global
    /// fetches; elapsing with no recorded error forces a terminal error.
    pub bootstrap_ceiling_ms: u64,
    /// Sessions always kept from the front of the id-sorted list.
    pub session_limit: usize,
    /// Trailing activity window within which sessions are kept beyond
    /// the limit.
    pub session_window_ms: u64,
    /// Coalescer flush cadence, measured from the previous flush.
    pub flush_interval_ms: u64,
    /// Continuous-work budget before the event pump yields.
    pub yield_interval_ms: u64,
    pub concurrency: ConcurrencyMode,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout_ms: 10_000,
            retry: RetrySettings::default(),
            health: HealthSettings::default(),
            bootstrap_ceiling_ms: 30_000,
            session_limit: 5,
            session_window_ms: 4 * 60 * 60 * 1000,
            flush_interval_ms: 16,
            yield_interval_ms: 8,
            concurrency: ConcurrencyMode::default(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4096".to_string()
}

impl SyncConfig {
    /// Loads configuration from a TOML file; a missing file yields
    /// defaults.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(SyncConfig::default())
        }
    }

    /// Convenience constructor for embedding against a known endpoint.
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn bootstrap_ceiling(&self) -> Duration {
        Duration::from_millis(self.bootstrap_ceiling_ms)
    }

    pub fn session_window(&self) -> Duration {
        Duration::from_millis(self.session_window_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn yield_interval(&self) -> Duration {
        Duration::from_millis(self.yield_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health.interval_ms)
    }

    pub fn health_max_wait(&self) -> Duration {
        Duration::from_millis(self.health.max_wait_ms)
    }

    pub fn health_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.health.attempt_timeout_ms)
    }

    /// The one retry policy applied uniformly to bootstrap requests.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            timeout: self.request_timeout(),
        }
    }
}
