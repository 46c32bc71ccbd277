//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use exert_space::WorkerConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Concurrent leaf invocations
    pub pool_size: usize,

    /// Upper bound on one direct invocation
    pub invoke_timeout_ms: u64,

    /// Upper bound on waiting for a queued result
    pub queue_wait_timeout_ms: u64,

    /// Lookups tried for a discovered signature
    pub discovery_attempts: u32,

    /// Delay before the second lookup, doubled after each miss
    pub discovery_backoff_ms: u64,

    /// How long to keep retrying an endpoint lock
    pub lock_wait_ms: u64,

    /// Lease on an endpoint lock
    pub lock_lease_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            invoke_timeout_ms: 30_000,
            queue_wait_timeout_ms: 60_000,
            discovery_attempts: 3,
            discovery_backoff_ms: 100,
            lock_wait_ms: 5_000,
            lock_lease_ms: 60_000,
        }
    }
}

impl DispatcherConfig {
    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the invocation timeout.
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the queued-result wait.
    pub fn with_queue_wait_timeout(mut self, timeout: Duration) -> Self {
        self.queue_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set discovery attempts and initial backoff.
    pub fn with_discovery(mut self, attempts: u32, backoff: Duration) -> Self {
        self.discovery_attempts = attempts;
        self.discovery_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set how long to wait for an endpoint lock.
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait_ms = wait.as_millis() as u64;
        self
    }

    /// Invocation timeout.
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    /// Queued-result wait.
    pub fn queue_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_wait_timeout_ms)
    }

    /// Backoff before the given retry (1-based).
    pub fn discovery_backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.discovery_backoff_ms.saturating_mul(factor))
    }

    /// Lock wait.
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    /// Lock lease.
    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatcher settings
    pub dispatcher: DispatcherConfig,

    /// Worker pool settings
    pub worker: WorkerConfig,
}

impl EngineConfig {
    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse from JSON.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}
