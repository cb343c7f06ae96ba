//! Pure in-memory collections.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use super::annotation::{InMemoryRowAnnotationFactory, RowAnnotationFactory};
use super::{StorageProvider, StoredList, StoredMap, StoredSet};
use crate::error::Result;
use crate::schema::Value;

/// Keeps every collection in memory.
#[derive(Debug, Clone)]
pub struct InMemoryStorageProvider {
    annotation_sample_size: usize,
}

impl InMemoryStorageProvider {
    pub fn new(annotation_sample_size: usize) -> Self {
        Self {
            annotation_sample_size,
        }
    }
}

impl Default for InMemoryStorageProvider {
    fn default() -> Self {
        Self::new(100)
    }
}

impl StorageProvider for InMemoryStorageProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn create_list(&self) -> Result<Box<dyn StoredList>> {
        Ok(Box::new(InMemoryList::default()))
    }

    fn create_set(&self) -> Result<Box<dyn StoredSet>> {
        Ok(Box::new(InMemorySet::default()))
    }

    fn create_map(&self) -> Result<Box<dyn StoredMap>> {
        Ok(Box::new(InMemoryMap::default()))
    }

    fn create_row_annotation_factory(&self) -> Result<Arc<dyn RowAnnotationFactory>> {
        Ok(Arc::new(InMemoryRowAnnotationFactory::new(
            self.annotation_sample_size,
        )))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryList {
    values: Mutex<Vec<Value>>,
}

impl StoredList for InMemoryList {
    fn push(&self, value: Value) -> Result<()> {
        self.values.lock().push(value);
        Ok(())
    }

    fn get(&self, index: usize) -> Result<Option<Value>> {
        Ok(self.values.lock().get(index).cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.values.lock().len())
    }

    fn to_vec(&self) -> Result<Vec<Value>> {
        Ok(self.values.lock().clone())
    }

    fn clear(&self) -> Result<()> {
        self.values.lock().clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySet {
    values: Mutex<IndexSet<Value>>,
}

impl StoredSet for InMemorySet {
    fn insert(&self, value: Value) -> Result<bool> {
        Ok(self.values.lock().insert(value))
    }

    fn contains(&self, value: &Value) -> Result<bool> {
        Ok(self.values.lock().contains(value))
    }

    fn remove(&self, value: &Value) -> Result<bool> {
        Ok(self.values.lock().shift_remove(value))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.values.lock().len())
    }

    fn to_vec(&self) -> Result<Vec<Value>> {
        Ok(self.values.lock().iter().cloned().collect())
    }

    fn clear(&self) -> Result<()> {
        self.values.lock().clear();
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMap {
    entries: Mutex<IndexMap<Value, Value>>,
}

impl StoredMap for InMemoryMap {
    fn insert(&self, key: Value, value: Value) -> Result<Option<Value>> {
        Ok(self.entries.lock().insert(key, value))
    }

    fn get(&self, key: &Value) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn remove(&self, key: &Value) -> Result<Option<Value>> {
        Ok(self.entries.lock().shift_remove(key))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }

    fn entries(&self) -> Result<Vec<(Value, Value)>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    fn update(&self, key: Value, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<Value> {
        let mut entries = self.entries.lock();
        let next = f(entries.get(&key).cloned());
        entries.insert(key, next.clone());
        Ok(next)
    }
}
