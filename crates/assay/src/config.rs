//! Engine configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AssayError, Result};

/// What the scheduler does when a component fails on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record the error and keep processing other rows and branches.
    #[default]
    Continue,
    /// Stop reading rows after the first component error.
    AbortOnFirstError,
}

/// Which backing store the storage provider uses for collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sqlite,
    /// Start in memory and spill to SQLite past the spill threshold.
    #[default]
    Auto,
}

/// Overflow storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Entries a collection may hold in memory before spilling (Auto only).
    pub spill_threshold: usize,
    /// Parent directory for temporary databases (None = system temp dir).
    pub directory: Option<PathBuf>,
    /// Rows each annotation keeps as a materialized sample.
    pub annotation_sample_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Auto,
            spill_threshold: 10_000,
            directory: None,
            annotation_sample_size: 100,
        }
    }
}

/// Configuration passed to the job builder and runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads. One selects the single-threaded runner.
    pub concurrency: usize,
    /// Source rows allowed in flight before reading pauses.
    pub max_in_flight_rows: usize,
    /// Behaviour on component errors.
    pub error_policy: ErrorPolicy,
    /// Rows between progress notifications (0 = never).
    pub progress_interval: u64,
    /// Overflow storage settings.
    pub storage: StorageConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            max_in_flight_rows: 1_000,
            error_policy: ErrorPolicy::Continue,
            progress_interval: 10_000,
            storage: StorageConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Single-threaded configuration, mostly useful for tests and debugging.
    pub fn single_threaded() -> Self {
        Self::default().with_concurrency(1)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_in_flight_rows(mut self, rows: usize) -> Self {
        self.max_in_flight_rows = rows.max(1);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_storage_backend(mut self, backend: StorageBackend) -> Self {
        self.storage.backend = backend;
        self
    }

    pub fn with_spill_threshold(mut self, threshold: usize) -> Self {
        self.storage.spill_threshold = threshold;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| AssayError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&json)
    }

    pub fn is_single_threaded(&self) -> bool {
        self.concurrency <= 1
    }
}
