//! Datastores, their connections, and in-memory tables.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AssayError, Result};
use crate::schema::{DataType, Value};

/// Metadata about a source data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// File name without path.
    pub file: String,
    /// Full path to the file.
    pub path: PathBuf,
    /// SHA-256 hash of the file contents.
    pub hash: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Detected format (csv, tsv, etc.).
    pub format: String,
    /// Number of data rows (excluding header).
    pub row_count: usize,
    /// Number of columns.
    pub column_count: usize,
    /// When the file was read.
    pub read_at: DateTime<Utc>,
}

impl SourceMetadata {
    pub fn new(
        path: PathBuf,
        hash: String,
        size_bytes: u64,
        format: String,
        row_count: usize,
        column_count: usize,
    ) -> Self {
        let file = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            file,
            path,
            hash,
            size_bytes,
            format,
            row_count,
            column_count,
            read_at: Utc::now(),
        }
    }
}

/// A column as declared by a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    pub data_type: DataType,
}

impl SourceColumn {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// One physical row read from a datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub values: Vec<Value>,
    /// How many identical source rows this row stands for.
    pub distinct_count: u32,
}

impl SourceRow {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            distinct_count: 1,
        }
    }
}

/// A window of rows to read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowRange {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RowRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// Iterator over the rows of an open connection.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<SourceRow>> + 'a>;

/// Something rows can be read from.
///
/// Opening yields a connection that is released when dropped, including
/// when the execution that opened it fails.
pub trait Datastore: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self) -> Result<Box<dyn DatastoreConnection>>;
}

/// An open connection to a datastore.
pub trait DatastoreConnection {
    /// Ordered columns with their types.
    fn columns(&self) -> &[SourceColumn];

    fn row_count(&mut self) -> Result<usize>;

    /// Sequentially read the rows within `range`.
    fn read(&mut self, range: RowRange) -> Result<RowIter<'_>>;
}

/// Parsed tabular data held in memory.
#[derive(Debug, Clone)]
pub struct DataTable {
    /// Column declarations.
    pub columns: Vec<SourceColumn>,
    /// Row data (row-major order).
    pub rows: Vec<SourceRow>,
}

impl DataTable {
    pub fn new(columns: Vec<SourceColumn>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter().map(SourceRow::new).collect(),
        }
    }

    /// Build a table of string columns from raw text, treating missing-value
    /// tokens as null.
    pub fn from_strings(headers: &[&str], rows: &[&[&str]]) -> Self {
        let columns = headers
            .iter()
            .map(|h| SourceColumn::new(*h, DataType::String))
            .collect();
        let rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|raw| {
                        if Self::is_null_value(raw) {
                            Value::Null
                        } else {
                            Value::from(*raw)
                        }
                    })
                    .collect()
            })
            .collect();
        Self::new(columns, rows)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of physical rows; duplicates collapsed into one row count once.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of rows the table stands for, counting collapsed duplicates.
    pub fn total_count(&self) -> u64 {
        self.rows.iter().map(|r| r.distinct_count as u64).sum()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Get all values for a column by index.
    pub fn column_values(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.rows
            .iter()
            .filter_map(move |row| row.values.get(index))
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.values.get(col))
    }

    /// Merge identical rows into one row carrying the number of occurrences.
    ///
    /// First-occurrence order is kept.
    pub fn collapse_duplicates(self) -> Self {
        let mut positions: HashMap<Vec<Value>, usize> = HashMap::new();
        let mut rows: Vec<SourceRow> = Vec::new();

        for row in self.rows {
            match positions.get(&row.values) {
                Some(&index) => rows[index].distinct_count += row.distinct_count,
                None => {
                    positions.insert(row.values.clone(), rows.len());
                    rows.push(row);
                }
            }
        }

        Self {
            columns: self.columns,
            rows,
        }
    }

    /// Check if a value represents a missing/null value.
    pub fn is_null_value(value: &str) -> bool {
        let trimmed = value.trim();
        trimmed.is_empty()
            || trimmed.eq_ignore_ascii_case("na")
            || trimmed.eq_ignore_ascii_case("n/a")
            || trimmed.eq_ignore_ascii_case("null")
            || trimmed.eq_ignore_ascii_case("none")
            || trimmed.eq_ignore_ascii_case("nil")
            || trimmed == "."
            || trimmed == "-"
    }
}

/// A named in-memory datastore.
#[derive(Debug, Clone)]
pub struct MemoryDatastore {
    name: String,
    table: Arc<DataTable>,
}

impl MemoryDatastore {
    pub fn new(name: impl Into<String>, table: DataTable) -> Self {
        Self {
            name: name.into(),
            table: Arc::new(table),
        }
    }

    pub fn table(&self) -> &DataTable {
        &self.table
    }
}

impl Datastore for MemoryDatastore {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> Result<Box<dyn DatastoreConnection>> {
        Ok(Box::new(TableConnection {
            table: Arc::clone(&self.table),
        }))
    }
}

/// Connection over a shared in-memory table.
pub(crate) struct TableConnection {
    pub(crate) table: Arc<DataTable>,
}

impl DatastoreConnection for TableConnection {
    fn columns(&self) -> &[SourceColumn] {
        &self.table.columns
    }

    fn row_count(&mut self) -> Result<usize> {
        Ok(self.table.row_count())
    }

    fn read(&mut self, range: RowRange) -> Result<RowIter<'_>> {
        if range.offset > self.table.row_count() {
            return Err(AssayError::EmptyData(format!(
                "Offset {} is past the last row ({})",
                range.offset,
                self.table.row_count()
            )));
        }
        let limit = range.limit.unwrap_or(usize::MAX);
        Ok(Box::new(
            self.table
                .rows
                .iter()
                .skip(range.offset)
                .take(limit)
                .cloned()
                .map(Ok),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_strings_nulls() {
        let table = DataTable::from_strings(&["a", "b"], &[&["x", "NA"], &["", "y"]]);
        assert_eq!(table.get(0, 0), Some(&Value::from("x")));
        assert_eq!(table.get(0, 1), Some(&Value::Null));
        assert_eq!(table.get(1, 0), Some(&Value::Null));
    }

    #[test]
    fn test_collapse_duplicates() {
        let table = DataTable::from_strings(&["a"], &[&["x"], &["y"], &["x"], &["x"]]);
        let collapsed = table.collapse_duplicates();

        assert_eq!(collapsed.row_count(), 2);
        assert_eq!(collapsed.total_count(), 4);
        assert_eq!(collapsed.rows[0].distinct_count, 3);
        assert_eq!(collapsed.rows[1].values, vec![Value::from("y")]);
    }

    #[test]
    fn test_read_range() {
        let table = DataTable::from_strings(&["a"], &[&["1"], &["2"], &["3"], &["4"]]);
        let store = MemoryDatastore::new("numbers", table);
        let mut connection = store.open().unwrap();

        let rows: Vec<SourceRow> = connection
            .read(RowRange::new(1, 2))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values[0], Value::from("2"));
        assert!(connection.read(RowRange::new(9, 1)).is_err());
    }

    #[test]
    fn test_is_null_value() {
        assert!(DataTable::is_null_value(""));
        assert!(DataTable::is_null_value("NA"));
        assert!(DataTable::is_null_value("N/A"));
        assert!(DataTable::is_null_value("null"));
        assert!(DataTable::is_null_value("."));
        assert!(!DataTable::is_null_value("value"));
        assert!(!DataTable::is_null_value("0"));
    }
}
