//! Collections and annotations backed by a temporary SQLite database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::annotation::{RowAnnotation, RowAnnotationFactory};
use super::{
    StorageProvider, StoredList, StoredMap, StoredSet, decode, decode_value, encode, encode_value,
};
use crate::error::{AssayError, Result};
use crate::input::{InputRow, RowId};
use crate::schema::{ColumnId, InputColumn, Value};

/// One database file in its own temporary directory. The directory and
/// everything in it is removed when the last collection lets go of it.
pub(crate) struct SqliteStore {
    conn: Mutex<Connection>,
    tables: AtomicU64,
    _dir: TempDir,
}

impl SqliteStore {
    pub(crate) fn open(directory: Option<&Path>) -> Result<Arc<Self>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("assay-");
        let dir = match directory {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|source| AssayError::Io {
            path: directory.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
            source,
        })?;

        let path: PathBuf = dir.path().join("storage.db");
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=OFF;
            PRAGMA temp_store=MEMORY;
            "#,
        )?;
        debug!(path = %path.display(), "opened overflow database");

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            tables: AtomicU64::new(0),
            _dir: dir,
        }))
    }

    fn create_table(&self, kind: &str, columns: &str) -> Result<String> {
        let table = format!("{}_{}", kind, self.tables.fetch_add(1, Ordering::Relaxed));
        self.conn
            .lock()
            .execute_batch(&format!("CREATE TABLE {} ({});", table, columns))?;
        Ok(table)
    }

    fn drop_tables(&self, tables: &[&str]) {
        let conn = self.conn.lock();
        for table in tables {
            if let Err(e) = conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table)) {
                warn!(table, error = %e, "failed to drop overflow table");
            }
        }
    }
}

/// Stores every collection in a temporary SQLite database.
#[derive(Clone)]
pub struct SqliteStorageProvider {
    store: Arc<SqliteStore>,
    annotation_sample_size: usize,
}

impl SqliteStorageProvider {
    /// Create the database in a fresh temporary directory under `directory`
    /// (or the system temp dir).
    pub fn new(directory: Option<&Path>, annotation_sample_size: usize) -> Result<Self> {
        Ok(Self {
            store: SqliteStore::open(directory)?,
            annotation_sample_size,
        })
    }

    pub(crate) fn list(&self) -> Result<SqliteList> {
        SqliteList::new(self.store.clone())
    }

    pub(crate) fn set(&self) -> Result<SqliteSet> {
        SqliteSet::new(self.store.clone())
    }

    pub(crate) fn map(&self) -> Result<SqliteMap> {
        SqliteMap::new(self.store.clone())
    }

    pub(crate) fn annotation_factory(&self) -> Result<SqliteRowAnnotationFactory> {
        SqliteRowAnnotationFactory::new(self.store.clone(), self.annotation_sample_size)
    }
}

impl StorageProvider for SqliteStorageProvider {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn create_list(&self) -> Result<Box<dyn StoredList>> {
        Ok(Box::new(self.list()?))
    }

    fn create_set(&self) -> Result<Box<dyn StoredSet>> {
        Ok(Box::new(self.set()?))
    }

    fn create_map(&self) -> Result<Box<dyn StoredMap>> {
        Ok(Box::new(self.map()?))
    }

    fn create_row_annotation_factory(&self) -> Result<Arc<dyn RowAnnotationFactory>> {
        Ok(Arc::new(self.annotation_factory()?))
    }
}

fn count(conn: &Connection, table: &str) -> Result<usize> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
    Ok(n as usize)
}

fn decode_column(conn: &Connection, sql: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        values.push(decode_value(&text)?);
    }
    Ok(values)
}

pub(crate) struct SqliteList {
    store: Arc<SqliteStore>,
    table: String,
}

impl SqliteList {
    fn new(store: Arc<SqliteStore>) -> Result<Self> {
        let table = store.create_table("list", "idx INTEGER PRIMARY KEY, value TEXT NOT NULL")?;
        Ok(Self { store, table })
    }

    /// Append many values in one transaction.
    pub(crate) fn extend(&self, values: impl IntoIterator<Item = Value>) -> Result<()> {
        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!("INSERT INTO {} (value) VALUES (?1)", self.table))?;
            for value in values {
                stmt.execute(params![encode_value(&value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl StoredList for SqliteList {
    fn push(&self, value: Value) -> Result<()> {
        let encoded = encode_value(&value)?;
        self.store.conn.lock().execute(
            &format!("INSERT INTO {} (value) VALUES (?1)", self.table),
            params![encoded],
        )?;
        Ok(())
    }

    fn get(&self, index: usize) -> Result<Option<Value>> {
        let conn = self.store.conn.lock();
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE idx = ?1", self.table),
                params![index as i64 + 1],
                |row| row.get(0),
            )
            .optional()?;
        text.map(|t| decode_value(&t)).transpose()
    }

    fn len(&self) -> Result<usize> {
        count(&self.store.conn.lock(), &self.table)
    }

    fn to_vec(&self) -> Result<Vec<Value>> {
        decode_column(
            &self.store.conn.lock(),
            &format!("SELECT value FROM {} ORDER BY idx", self.table),
        )
    }

    fn clear(&self) -> Result<()> {
        self.store
            .conn
            .lock()
            .execute(&format!("DELETE FROM {}", self.table), [])?;
        Ok(())
    }
}

impl Drop for SqliteList {
    fn drop(&mut self) {
        self.store.drop_tables(&[self.table.as_str()]);
    }
}

pub(crate) struct SqliteSet {
    store: Arc<SqliteStore>,
    table: String,
}

impl SqliteSet {
    fn new(store: Arc<SqliteStore>) -> Result<Self> {
        let table = store.create_table(
            "set",
            "seq INTEGER PRIMARY KEY, value TEXT NOT NULL UNIQUE",
        )?;
        Ok(Self { store, table })
    }

    pub(crate) fn extend(&self, values: impl IntoIterator<Item = Value>) -> Result<()> {
        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {} (value) VALUES (?1)",
                self.table
            ))?;
            for value in values {
                stmt.execute(params![encode_value(&value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl StoredSet for SqliteSet {
    fn insert(&self, value: Value) -> Result<bool> {
        let encoded = encode_value(&value)?;
        let changed = self.store.conn.lock().execute(
            &format!("INSERT OR IGNORE INTO {} (value) VALUES (?1)", self.table),
            params![encoded],
        )?;
        Ok(changed == 1)
    }

    fn contains(&self, value: &Value) -> Result<bool> {
        let encoded = encode_value(value)?;
        let found = self
            .store
            .conn
            .lock()
            .query_row(
                &format!("SELECT 1 FROM {} WHERE value = ?1", self.table),
                params![encoded],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn remove(&self, value: &Value) -> Result<bool> {
        let encoded = encode_value(value)?;
        let changed = self.store.conn.lock().execute(
            &format!("DELETE FROM {} WHERE value = ?1", self.table),
            params![encoded],
        )?;
        Ok(changed == 1)
    }

    fn len(&self) -> Result<usize> {
        count(&self.store.conn.lock(), &self.table)
    }

    fn to_vec(&self) -> Result<Vec<Value>> {
        decode_column(
            &self.store.conn.lock(),
            &format!("SELECT value FROM {} ORDER BY seq", self.table),
        )
    }

    fn clear(&self) -> Result<()> {
        self.store
            .conn
            .lock()
            .execute(&format!("DELETE FROM {}", self.table), [])?;
        Ok(())
    }
}

impl Drop for SqliteSet {
    fn drop(&mut self) {
        self.store.drop_tables(&[self.table.as_str()]);
    }
}

pub(crate) struct SqliteMap {
    store: Arc<SqliteStore>,
    table: String,
}

impl SqliteMap {
    fn new(store: Arc<SqliteStore>) -> Result<Self> {
        let table = store.create_table(
            "map",
            "seq INTEGER PRIMARY KEY, key TEXT NOT NULL UNIQUE, value TEXT NOT NULL",
        )?;
        Ok(Self { store, table })
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            self.table
        )
    }

    fn select(&self, conn: &Connection, key: &str) -> Result<Option<Value>> {
        let text: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", self.table),
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        text.map(|t| decode_value(&t)).transpose()
    }

    pub(crate) fn extend(&self, entries: impl IntoIterator<Item = (Value, Value)>) -> Result<()> {
        let sql = self.upsert_sql();
        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (key, value) in entries {
                stmt.execute(params![encode_value(&key)?, encode_value(&value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl StoredMap for SqliteMap {
    fn insert(&self, key: Value, value: Value) -> Result<Option<Value>> {
        let key = encode_value(&key)?;
        let value = encode_value(&value)?;
        let conn = self.store.conn.lock();
        let previous = self.select(&conn, &key)?;
        conn.execute(&self.upsert_sql(), params![key, value])?;
        Ok(previous)
    }

    fn get(&self, key: &Value) -> Result<Option<Value>> {
        let key = encode_value(key)?;
        self.select(&self.store.conn.lock(), &key)
    }

    fn remove(&self, key: &Value) -> Result<Option<Value>> {
        let key = encode_value(key)?;
        let conn = self.store.conn.lock();
        let previous = self.select(&conn, &key)?;
        if previous.is_some() {
            conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table),
                params![key],
            )?;
        }
        Ok(previous)
    }

    fn len(&self) -> Result<usize> {
        count(&self.store.conn.lock(), &self.table)
    }

    fn entries(&self) -> Result<Vec<(Value, Value)>> {
        let conn = self.store.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {} ORDER BY seq", self.table))?;
        let mut rows = stmt.query([])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            entries.push((decode_value(&key)?, decode_value(&value)?));
        }
        Ok(entries)
    }

    fn clear(&self) -> Result<()> {
        self.store
            .conn
            .lock()
            .execute(&format!("DELETE FROM {}", self.table), [])?;
        Ok(())
    }

    fn update(&self, key: Value, f: &mut dyn FnMut(Option<Value>) -> Value) -> Result<Value> {
        let encoded_key = encode_value(&key)?;
        let conn = self.store.conn.lock();
        let next = f(self.select(&conn, &encoded_key)?);
        conn.execute(&self.upsert_sql(), params![encoded_key, encode_value(&next)?])?;
        Ok(next)
    }
}

impl Drop for SqliteMap {
    fn drop(&mut self) {
        self.store.drop_tables(&[self.table.as_str()]);
    }
}

/// Annotations kept in the overflow database.
///
/// Every annotated row is stored once, with its values, regardless of how
/// many annotations reference it. `rows` returns at most `sample_size` rows
/// but value counts cover every annotated row.
pub struct SqliteRowAnnotationFactory {
    store: Arc<SqliteStore>,
    rows_table: String,
    members_table: String,
    sample_size: usize,
    columns: Mutex<HashMap<ColumnId, InputColumn>>,
}

impl SqliteRowAnnotationFactory {
    pub(crate) fn new(store: Arc<SqliteStore>, sample_size: usize) -> Result<Self> {
        let prefix = format!("annotations_{}", store.tables.fetch_add(1, Ordering::Relaxed));
        let rows_table = format!("{}_rows", prefix);
        let members_table = format!("{}_members", prefix);
        store.conn.lock().execute_batch(&format!(
            r#"
            CREATE TABLE {rows} (
                row_id          INTEGER PRIMARY KEY,
                distinct_count  INTEGER NOT NULL,
                payload         TEXT NOT NULL
            );
            CREATE TABLE {members} (
                annotation  INTEGER NOT NULL,
                row_id      INTEGER NOT NULL,
                PRIMARY KEY (annotation, row_id)
            );
            "#,
            rows = rows_table,
            members = members_table,
        ))?;
        Ok(Self {
            store,
            rows_table,
            members_table,
            sample_size,
            columns: Mutex::new(HashMap::new()),
        })
    }

    fn encode_row(&self, row: &InputRow) -> Result<String> {
        let entries = row.entries();
        let mut columns = self.columns.lock();
        let payload: Vec<(u64, &Value)> = entries
            .iter()
            .map(|(column, value)| {
                columns
                    .entry(column.id())
                    .or_insert_with(|| column.clone());
                (column.id().0, value)
            })
            .collect();
        encode(&payload)
    }

    /// Store memberships recorded elsewhere, in order. Annotation row
    /// counts are left alone since they already include these rows.
    pub(crate) fn import(&self, annotation: u64, members: Vec<(InputRow, u32)>) -> Result<()> {
        let encoded: Vec<(i64, u32, String)> = members
            .iter()
            .map(|(row, distinct_count)| {
                Ok((row.id().value() as i64, *distinct_count, self.encode_row(row)?))
            })
            .collect::<Result<_>>()?;

        let mut conn = self.store.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut insert_row = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {} (row_id, distinct_count, payload) VALUES (?1, ?2, ?3)",
                self.rows_table
            ))?;
            let mut insert_member = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {} (annotation, row_id) VALUES (?1, ?2)",
                self.members_table
            ))?;
            for (row_id, distinct_count, payload) in &encoded {
                insert_row.execute(params![row_id, *distinct_count as i64, payload])?;
                insert_member.execute(params![annotation as i64, row_id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn decode_row(&self, row_id: i64, payload: &str) -> Result<InputRow> {
        let entries: Vec<(u64, Value)> = decode(payload)?;
        let columns = self.columns.lock();
        let values = entries
            .into_iter()
            .filter_map(|(id, value)| columns.get(&ColumnId(id)).map(|c| (c.clone(), value)))
            .collect();
        Ok(InputRow::new(RowId::from_raw(row_id as u64), values))
    }
}

impl RowAnnotationFactory for SqliteRowAnnotationFactory {
    fn annotate(
        &self,
        row: &InputRow,
        distinct_count: u32,
        annotation: &RowAnnotation,
    ) -> Result<()> {
        let row_id = row.id().value() as i64;
        let payload = self.encode_row(row)?;
        let conn = self.store.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (row_id, distinct_count, payload) VALUES (?1, ?2, ?3)",
                self.rows_table
            ),
            params![row_id, distinct_count as i64, payload],
        )?;
        let added = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (annotation, row_id) VALUES (?1, ?2)",
                self.members_table
            ),
            params![annotation.id() as i64, row_id],
        )?;
        if added == 1 {
            annotation.add_rows(distinct_count as u64);
        }
        Ok(())
    }

    fn is_annotated(&self, row: &InputRow, annotation: &RowAnnotation) -> Result<bool> {
        let found = self
            .store
            .conn
            .lock()
            .query_row(
                &format!(
                    "SELECT 1 FROM {} WHERE annotation = ?1 AND row_id = ?2",
                    self.members_table
                ),
                params![annotation.id() as i64, row.id().value() as i64],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn reset(&self, annotation: &RowAnnotation) -> Result<()> {
        self.store.conn.lock().execute(
            &format!("DELETE FROM {} WHERE annotation = ?1", self.members_table),
            params![annotation.id() as i64],
        )?;
        annotation.reset_count();
        Ok(())
    }

    fn sample_size(&self) -> usize {
        self.sample_size
    }

    fn rows(&self, annotation: &RowAnnotation) -> Result<Vec<InputRow>> {
        let conn = self.store.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT r.row_id, r.payload FROM {members} m
             JOIN {rows} r ON r.row_id = m.row_id
             WHERE m.annotation = ?1
             ORDER BY m.rowid
             LIMIT ?2",
            members = self.members_table,
            rows = self.rows_table,
        ))?;
        let mut query = stmt.query(params![annotation.id() as i64, self.sample_size as i64])?;
        let mut rows = Vec::new();
        while let Some(row) = query.next()? {
            let id: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            rows.push(self.decode_row(id, &payload)?);
        }
        Ok(rows)
    }

    fn value_counts(
        &self,
        annotation: &RowAnnotation,
        column: &InputColumn,
    ) -> Result<IndexMap<Value, u64>> {
        let conn = self.store.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT r.distinct_count, r.payload FROM {members} m
             JOIN {rows} r ON r.row_id = m.row_id
             WHERE m.annotation = ?1
             ORDER BY m.rowid",
            members = self.members_table,
            rows = self.rows_table,
        ))?;
        let mut query = stmt.query(params![annotation.id() as i64])?;
        let target = column.id().0;
        let mut counts: IndexMap<Value, u64> = IndexMap::new();
        while let Some(row) = query.next()? {
            let distinct_count: i64 = row.get(0)?;
            let payload: String = row.get(1)?;
            let entries: Vec<(u64, Value)> = decode(&payload)?;
            let value = entries
                .into_iter()
                .find(|(id, _)| *id == target)
                .map(|(_, v)| v)
                .unwrap_or(Value::Null);
            *counts.entry(value).or_insert(0) += distinct_count as u64;
        }
        counts.sort_by(|_, a, _, b| b.cmp(a));
        Ok(counts)
    }

    fn transfer_annotations(&self, from: &RowAnnotation, to: &RowAnnotation) -> Result<()> {
        if from == to {
            return Ok(());
        }
        let conn = self.store.conn.lock();
        let added: i64 = conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(r.distinct_count), 0) FROM {members} m
                 JOIN {rows} r ON r.row_id = m.row_id
                 WHERE m.annotation = ?1
                 AND NOT EXISTS (
                     SELECT 1 FROM {members} x WHERE x.annotation = ?2 AND x.row_id = m.row_id
                 )",
                members = self.members_table,
                rows = self.rows_table,
            ),
            params![from.id() as i64, to.id() as i64],
            |row| row.get(0),
        )?;
        conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {members} (annotation, row_id)
                 SELECT ?2, row_id FROM {members} WHERE annotation = ?1 ORDER BY rowid",
                members = self.members_table,
            ),
            params![from.id() as i64, to.id() as i64],
        )?;
        to.add_rows(added as u64);
        Ok(())
    }
}

impl Drop for SqliteRowAnnotationFactory {
    fn drop(&mut self) {
        self.store
            .drop_tables(&[self.members_table.as_str(), self.rows_table.as_str()]);
    }
}
