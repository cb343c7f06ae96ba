//! Overflow storage: collections and row annotations that may live on disk.
//!
//! Components obtain collections from a [`StorageProvider`] instead of
//! allocating unbounded in-memory structures. The provider decides whether
//! the data stays in memory, goes straight to a temporary SQLite database,
//! or starts in memory and spills once it grows past a threshold.
//!
//! Every collection is thread-safe and releases its backing resources when
//! dropped.

mod annotation;
mod memory;
mod spill;
mod sqlite;

pub use annotation::{InMemoryRowAnnotationFactory, RowAnnotation, RowAnnotationFactory};
pub use memory::{InMemoryList, InMemoryMap, InMemorySet, InMemoryStorageProvider};
pub use spill::SpillingStorageProvider;
pub use sqlite::{SqliteRowAnnotationFactory, SqliteStorageProvider};

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{AssayError, Result};
use crate::schema::Value;

/// An ordered list of values.
pub trait StoredList: Send + Sync {
    fn push(&self, value: Value) -> Result<()>;

    fn get(&self, index: usize) -> Result<Option<Value>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of all values in insertion order.
    fn to_vec(&self) -> Result<Vec<Value>>;

    fn clear(&self) -> Result<()>;
}

/// A set of values, iterated in first-insertion order.
pub trait StoredSet: Send + Sync {
    /// Returns true if the value was not present.
    fn insert(&self, value: Value) -> Result<bool>;

    fn contains(&self, value: &Value) -> Result<bool>;

    fn remove(&self, value: &Value) -> Result<bool>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn to_vec(&self) -> Result<Vec<Value>>;

    fn clear(&self) -> Result<()>;
}

/// A map between values, iterated in first-insertion order of keys.
pub trait StoredMap: Send + Sync {
    /// Returns the previous value.
    fn insert(&self, key: Value, value: Value) -> Result<Option<Value>>;

    fn get(&self, key: &Value) -> Result<Option<Value>>;

    fn remove(&self, key: &Value) -> Result<Option<Value>>;

    fn contains_key(&self, key: &Value) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn entries(&self) -> Result<Vec<(Value, Value)>>;

    fn clear(&self) -> Result<()>;

    /// Replace the value for `key` with `f(current)` as one atomic step and
    /// return the new value.
    fn update(&self, key: Value, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<Value>;
}

/// Factory for overflow-capable collections.
pub trait StorageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_list(&self) -> Result<Box<dyn StoredList>>;

    fn create_set(&self) -> Result<Box<dyn StoredSet>>;

    fn create_map(&self) -> Result<Box<dyn StoredMap>>;

    fn create_row_annotation_factory(&self) -> Result<Arc<dyn RowAnnotationFactory>>;
}

/// Build the provider selected by the configuration.
pub fn create_storage_provider(config: &StorageConfig) -> Result<Arc<dyn StorageProvider>> {
    let provider: Arc<dyn StorageProvider> = match config.backend {
        StorageBackend::Memory => Arc::new(InMemoryStorageProvider::new(config.annotation_sample_size)),
        StorageBackend::Sqlite => Arc::new(SqliteStorageProvider::new(
            config.directory.as_deref(),
            config.annotation_sample_size,
        )?),
        StorageBackend::Auto => Arc::new(SpillingStorageProvider::new(config.clone())),
    };
    debug!(provider = provider.name(), "storage provider created");
    Ok(provider)
}

/// Encode a value as a stable text key.
pub(crate) fn encode_value(value: &Value) -> Result<String> {
    encode(value)
}

pub(crate) fn decode_value(text: &str) -> Result<Value> {
    decode(text)
}

/// Text form of anything kept in the overflow database. Failures are
/// storage errors, which end the execution.
pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| AssayError::Storage(format!("cannot encode stored value: {}", e)))
}

pub(crate) fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| AssayError::Storage(format!("cannot decode stored value: {}", e)))
}
