//! Collections that start in memory and move to SQLite once they grow.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::annotation::{InMemoryRowAnnotationFactory, RowAnnotation, RowAnnotationFactory};
use super::sqlite::{
    SqliteList, SqliteMap, SqliteRowAnnotationFactory, SqliteSet, SqliteStorageProvider,
};
use super::{StorageProvider, StoredList, StoredMap, StoredSet};
use crate::config::StorageConfig;
use crate::error::Result;
use crate::input::InputRow;
use crate::schema::{InputColumn, Value};

struct Shared {
    config: StorageConfig,
    disk: OnceCell<SqliteStorageProvider>,
}

impl Shared {
    fn disk(&self) -> Result<&SqliteStorageProvider> {
        self.disk.get_or_try_init(|| {
            debug!(
                threshold = self.config.spill_threshold,
                "creating overflow database"
            );
            SqliteStorageProvider::new(
                self.config.directory.as_deref(),
                self.config.annotation_sample_size,
            )
        })
    }

    fn over(&self, len: usize) -> bool {
        len > self.config.spill_threshold
    }
}

/// Keeps each collection in memory until it holds more than
/// `spill_threshold` entries, then moves it into a temporary database.
///
/// The database is created the first time any collection spills. Row
/// annotations spill the same way once their memberships, counted over all
/// annotations of one factory, exceed the threshold.
#[derive(Clone)]
pub struct SpillingStorageProvider {
    shared: Arc<Shared>,
}

impl SpillingStorageProvider {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                disk: OnceCell::new(),
            }),
        }
    }

    /// True once any collection of this provider has moved to disk.
    pub fn has_spilled(&self) -> bool {
        self.shared.disk.get().is_some()
    }
}

impl StorageProvider for SpillingStorageProvider {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn create_list(&self) -> Result<Box<dyn StoredList>> {
        Ok(Box::new(SpillingList {
            shared: self.shared.clone(),
            state: Mutex::new(ListState::Memory(Vec::new())),
        }))
    }

    fn create_set(&self) -> Result<Box<dyn StoredSet>> {
        Ok(Box::new(SpillingSet {
            shared: self.shared.clone(),
            state: Mutex::new(SetState::Memory(IndexSet::new())),
        }))
    }

    fn create_map(&self) -> Result<Box<dyn StoredMap>> {
        Ok(Box::new(SpillingMap {
            shared: self.shared.clone(),
            state: Mutex::new(MapState::Memory(IndexMap::new())),
        }))
    }

    fn create_row_annotation_factory(&self) -> Result<Arc<dyn RowAnnotationFactory>> {
        Ok(Arc::new(SpillingRowAnnotationFactory {
            shared: self.shared.clone(),
            state: RwLock::new(AnnotationState::Memory(InMemoryRowAnnotationFactory::new(
                self.shared.config.annotation_sample_size,
            ))),
        }))
    }
}

enum AnnotationState {
    Memory(InMemoryRowAnnotationFactory),
    Disk(SqliteRowAnnotationFactory),
}

impl AnnotationState {
    fn factory(&self) -> &dyn RowAnnotationFactory {
        match self {
            AnnotationState::Memory(memory) => memory,
            AnnotationState::Disk(disk) => disk,
        }
    }
}

struct SpillingRowAnnotationFactory {
    shared: Arc<Shared>,
    state: RwLock<AnnotationState>,
}

impl SpillingRowAnnotationFactory {
    /// Move every membership to disk if the in-memory factory has grown
    /// past the threshold.
    fn spill_if_over(&self) -> Result<()> {
        let mut state = self.state.write();
        let AnnotationState::Memory(memory) = &*state else {
            return Ok(());
        };
        if !self.shared.over(memory.member_count()) {
            return Ok(());
        }
        let disk = self.shared.disk()?.annotation_factory()?;
        let mut moved = 0;
        for (annotation, members) in memory.drain() {
            moved += members.len();
            disk.import(annotation, members)?;
        }
        debug!(memberships = moved, "row annotations spilled to disk");
        *state = AnnotationState::Disk(disk);
        Ok(())
    }
}

impl RowAnnotationFactory for SpillingRowAnnotationFactory {
    fn annotate(
        &self,
        row: &InputRow,
        distinct_count: u32,
        annotation: &RowAnnotation,
    ) -> Result<()> {
        let in_memory = {
            let state = self.state.read();
            state.factory().annotate(row, distinct_count, annotation)?;
            matches!(&*state, AnnotationState::Memory(_))
        };
        if in_memory {
            self.spill_if_over()?;
        }
        Ok(())
    }

    fn is_annotated(&self, row: &InputRow, annotation: &RowAnnotation) -> Result<bool> {
        self.state.read().factory().is_annotated(row, annotation)
    }

    fn reset(&self, annotation: &RowAnnotation) -> Result<()> {
        self.state.read().factory().reset(annotation)
    }

    fn sample_size(&self) -> usize {
        self.shared.config.annotation_sample_size
    }

    fn rows(&self, annotation: &RowAnnotation) -> Result<Vec<InputRow>> {
        self.state.read().factory().rows(annotation)
    }

    fn value_counts(
        &self,
        annotation: &RowAnnotation,
        column: &InputColumn,
    ) -> Result<IndexMap<Value, u64>> {
        self.state.read().factory().value_counts(annotation, column)
    }

    fn transfer_annotations(&self, from: &RowAnnotation, to: &RowAnnotation) -> Result<()> {
        let in_memory = {
            let state = self.state.read();
            state.factory().transfer_annotations(from, to)?;
            matches!(&*state, AnnotationState::Memory(_))
        };
        if in_memory {
            self.spill_if_over()?;
        }
        Ok(())
    }
}

enum ListState {
    Memory(Vec<Value>),
    Disk(SqliteList),
}

struct SpillingList {
    shared: Arc<Shared>,
    state: Mutex<ListState>,
}

impl StoredList for SpillingList {
    fn push(&self, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        match &mut *state {
            ListState::Memory(values) => {
                if !self.shared.over(values.len() + 1) {
                    values.push(value);
                    return Ok(());
                }
                let disk = self.shared.disk()?.list()?;
                disk.extend(std::mem::take(values))?;
                disk.push(value)?;
                debug!(entries = disk.len()?, "list spilled to disk");
                *state = ListState::Disk(disk);
                Ok(())
            }
            ListState::Disk(disk) => disk.push(value),
        }
    }

    fn get(&self, index: usize) -> Result<Option<Value>> {
        match &*self.state.lock() {
            ListState::Memory(values) => Ok(values.get(index).cloned()),
            ListState::Disk(disk) => disk.get(index),
        }
    }

    fn len(&self) -> Result<usize> {
        match &*self.state.lock() {
            ListState::Memory(values) => Ok(values.len()),
            ListState::Disk(disk) => disk.len(),
        }
    }

    fn to_vec(&self) -> Result<Vec<Value>> {
        match &*self.state.lock() {
            ListState::Memory(values) => Ok(values.clone()),
            ListState::Disk(disk) => disk.to_vec(),
        }
    }

    fn clear(&self) -> Result<()> {
        match &mut *self.state.lock() {
            ListState::Memory(values) => {
                values.clear();
                Ok(())
            }
            ListState::Disk(disk) => disk.clear(),
        }
    }
}

enum SetState {
    Memory(IndexSet<Value>),
    Disk(SqliteSet),
}

struct SpillingSet {
    shared: Arc<Shared>,
    state: Mutex<SetState>,
}

impl StoredSet for SpillingSet {
    fn insert(&self, value: Value) -> Result<bool> {
        let mut state = self.state.lock();
        match &mut *state {
            SetState::Memory(values) => {
                if values.contains(&value) {
                    return Ok(false);
                }
                if !self.shared.over(values.len() + 1) {
                    return Ok(values.insert(value));
                }
                let disk = self.shared.disk()?.set()?;
                disk.extend(std::mem::take(values))?;
                let inserted = disk.insert(value)?;
                debug!(entries = disk.len()?, "set spilled to disk");
                *state = SetState::Disk(disk);
                Ok(inserted)
            }
            SetState::Disk(disk) => disk.insert(value),
        }
    }

    fn contains(&self, value: &Value) -> Result<bool> {
        match &*self.state.lock() {
            SetState::Memory(values) => Ok(values.contains(value)),
            SetState::Disk(disk) => disk.contains(value),
        }
    }

    fn remove(&self, value: &Value) -> Result<bool> {
        match &mut *self.state.lock() {
            SetState::Memory(values) => Ok(values.shift_remove(value)),
            SetState::Disk(disk) => disk.remove(value),
        }
    }

    fn len(&self) -> Result<usize> {
        match &*self.state.lock() {
            SetState::Memory(values) => Ok(values.len()),
            SetState::Disk(disk) => disk.len(),
        }
    }

    fn to_vec(&self) -> Result<Vec<Value>> {
        match &*self.state.lock() {
            SetState::Memory(values) => Ok(values.iter().cloned().collect()),
            SetState::Disk(disk) => disk.to_vec(),
        }
    }

    fn clear(&self) -> Result<()> {
        match &mut *self.state.lock() {
            SetState::Memory(values) => {
                values.clear();
                Ok(())
            }
            SetState::Disk(disk) => disk.clear(),
        }
    }
}

enum MapState {
    Memory(IndexMap<Value, Value>),
    Disk(SqliteMap),
}

struct SpillingMap {
    shared: Arc<Shared>,
    state: Mutex<MapState>,
}

impl SpillingMap {
    /// Move the map to disk if adding `key` would cross the threshold.
    fn reserve(&self, state: &mut MapState, key: &Value) -> Result<()> {
        if let MapState::Memory(entries) = state {
            if entries.contains_key(key) || !self.shared.over(entries.len() + 1) {
                return Ok(());
            }
            let disk = self.shared.disk()?.map()?;
            disk.extend(std::mem::take(entries))?;
            debug!(entries = disk.len()?, "map spilled to disk");
            *state = MapState::Disk(disk);
        }
        Ok(())
    }
}

impl StoredMap for SpillingMap {
    fn insert(&self, key: Value, value: Value) -> Result<Option<Value>> {
        let mut state = self.state.lock();
        self.reserve(&mut state, &key)?;
        match &mut *state {
            MapState::Memory(entries) => Ok(entries.insert(key, value)),
            MapState::Disk(disk) => disk.insert(key, value),
        }
    }

    fn get(&self, key: &Value) -> Result<Option<Value>> {
        match &*self.state.lock() {
            MapState::Memory(entries) => Ok(entries.get(key).cloned()),
            MapState::Disk(disk) => disk.get(key),
        }
    }

    fn remove(&self, key: &Value) -> Result<Option<Value>> {
        match &mut *self.state.lock() {
            MapState::Memory(entries) => Ok(entries.shift_remove(key)),
            MapState::Disk(disk) => disk.remove(key),
        }
    }

    fn len(&self) -> Result<usize> {
        match &*self.state.lock() {
            MapState::Memory(entries) => Ok(entries.len()),
            MapState::Disk(disk) => disk.len(),
        }
    }

    fn entries(&self) -> Result<Vec<(Value, Value)>> {
        match &*self.state.lock() {
            MapState::Memory(entries) => Ok(entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            MapState::Disk(disk) => disk.entries(),
        }
    }

    fn clear(&self) -> Result<()> {
        match &mut *self.state.lock() {
            MapState::Memory(entries) => {
                entries.clear();
                Ok(())
            }
            MapState::Disk(disk) => disk.clear(),
        }
    }

    fn update(&self, key: Value, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<Value> {
        let mut state = self.state.lock();
        self.reserve(&mut state, &key)?;
        match &mut *state {
            MapState::Memory(entries) => {
                let next = f(entries.get(&key).cloned());
                entries.insert(key, next.clone());
                Ok(next)
            }
            MapState::Disk(disk) => disk.update(key, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::input::RowId;
    use crate::schema::{ColumnId, DataType};

    fn provider(dir: &tempfile::TempDir, threshold: usize) -> SpillingStorageProvider {
        SpillingStorageProvider::new(StorageConfig {
            backend: StorageBackend::Auto,
            spill_threshold: threshold,
            directory: Some(dir.path().to_path_buf()),
            annotation_sample_size: 10,
        })
    }

    #[test]
    fn test_small_collections_stay_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, 3);
        let list = provider.create_list().unwrap();
        for i in 0..3 {
            list.push(Value::Integer(i)).unwrap();
        }
        assert!(!provider.has_spilled());
        assert_eq!(list.len().unwrap(), 3);
    }

    #[test]
    fn test_list_spills_and_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, 3);
        let list = provider.create_list().unwrap();
        for i in 0..10 {
            list.push(Value::Integer(i)).unwrap();
        }
        assert!(provider.has_spilled());
        assert_eq!(list.len().unwrap(), 10);
        assert_eq!(list.get(4).unwrap(), Some(Value::Integer(4)));
        let expected: Vec<Value> = (0..10).map(Value::Integer).collect();
        assert_eq!(list.to_vec().unwrap(), expected);
    }

    #[test]
    fn test_set_spill_preserves_membership() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, 2);
        let set = provider.create_set().unwrap();
        for name in ["a", "b", "a", "c", "d", "b"] {
            set.insert(Value::from(name)).unwrap();
        }
        assert!(provider.has_spilled());
        assert_eq!(set.len().unwrap(), 4);
        assert!(set.contains(&Value::from("c")).unwrap());
        assert_eq!(
            set.to_vec().unwrap(),
            vec![Value::from("a"), Value::from("b"), Value::from("c"), Value::from("d")]
        );
    }

    #[test]
    fn test_annotations_spill_and_keep_contract() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, 4);
        let factory = provider.create_row_annotation_factory().unwrap();
        let column = InputColumn::source(ColumnId(0), "city", DataType::String);
        let row = |id: u64, city: &str| {
            InputRow::new(RowId::physical(id), vec![(column.clone(), Value::from(city))])
        };

        let annotation = factory.create_annotation();
        let other = factory.create_annotation();
        factory.annotate(&row(1, "Oslo"), 2, &annotation).unwrap();
        factory.annotate(&row(2, "Rome"), 1, &annotation).unwrap();
        factory.annotate(&row(2, "Rome"), 1, &other).unwrap();
        assert!(!provider.has_spilled());

        for id in 3..=15 {
            factory.annotate(&row(id, "Oslo"), 1, &annotation).unwrap();
            factory.annotate(&row(id, "Oslo"), 1, &annotation).unwrap();
        }
        assert!(provider.has_spilled());

        assert_eq!(annotation.row_count(), 16);
        assert!(factory.is_annotated(&row(1, "Oslo"), &annotation).unwrap());
        assert!(!factory.is_annotated(&row(1, "Oslo"), &other).unwrap());

        let rows = factory.rows(&annotation).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].id(), RowId::physical(1));
        assert_eq!(rows[1].value(&column), &Value::from("Rome"));

        let counts = factory.value_counts(&annotation, &column).unwrap();
        assert_eq!(counts.get_index(0), Some((&Value::from("Oslo"), &15)));
        assert_eq!(counts.get(&Value::from("Rome")), Some(&1));

        factory.transfer_annotations(&annotation, &other).unwrap();
        assert_eq!(other.row_count(), 16);
        factory.reset(&annotation).unwrap();
        assert_eq!(annotation.row_count(), 0);
        assert!(factory.rows(&annotation).unwrap().is_empty());
    }

    #[test]
    fn test_map_counts_survive_spill() {
        let dir = tempfile::tempdir().unwrap();
        let provider = provider(&dir, 2);
        let map = provider.create_map().unwrap();
        let mut increment = |current: Option<Value>| {
            Value::Integer(current.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
        };
        for key in ["x", "y", "x", "z", "x", "w"] {
            map.update(Value::from(key), &mut increment).unwrap();
        }
        assert!(provider.has_spilled());
        assert_eq!(map.get(&Value::from("x")).unwrap(), Some(Value::Integer(3)));
        assert_eq!(map.len().unwrap(), 4);
        assert_eq!(map.entries().unwrap()[0].0, Value::from("x"));
    }
}
