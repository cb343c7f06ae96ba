//! Rows and row identity.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::schema::{InputColumn, Value};

const VIRTUAL_BIT: u64 = 1 << 63;
const LOCAL_BITS: u32 = 28;
const LOCAL_MASK: u64 = (1 << LOCAL_BITS) - 1;
const ROOT_MASK: u64 = (1 << (63 - LOCAL_BITS)) - 1;

static NULL_VALUE: Value = Value::Null;

/// Identity of a row within one execution.
///
/// Physical rows are numbered from one in source order. Rows emitted by
/// multi-row transformers get virtual ids with the high bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(u64);

impl RowId {
    pub fn physical(number: u64) -> Self {
        RowId(number & !VIRTUAL_BIT)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        RowId(raw)
    }

    pub fn is_virtual(&self) -> bool {
        self.0 & VIRTUAL_BIT != 0
    }

    /// Number of the physical row this row is, or descends from.
    pub fn source_number(&self) -> u64 {
        if self.is_virtual() {
            (self.0 & !VIRTUAL_BIT) >> LOCAL_BITS
        } else {
            self.0
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_virtual() {
            write!(f, "{}v{:x}", self.source_number(), self.0 & LOCAL_MASK)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Hands out row ids for one execution (or for every partition of one
/// partitioned execution, when shared).
///
/// A virtual id packs the number of the source row it descends from above
/// a local part derived from the parent id, the position of the emitting
/// consumer and the emission ordinal. Rows of different source rows can
/// never collide, and collisions between descendants of one source row are
/// resolved by that row's [`IdScope`], which goes away with the row. The
/// same job over the same source yields the same ids however the rows are
/// scheduled.
#[derive(Debug, Default)]
pub struct RowIdGenerator {
    derived: AtomicU64,
}

impl RowIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the physical row at `ordinal` (zero based) in the source.
    pub fn physical(&self, ordinal: u64) -> RowId {
        RowId::physical(ordinal + 1)
    }

    /// Registry for the rows descending from one source row.
    pub fn scope(&self) -> IdScope {
        IdScope::default()
    }

    /// Id for the `ordinal`-th row emitted from `parent` by the consumer at `position`.
    pub fn derive(&self, scope: &IdScope, parent: RowId, position: usize, ordinal: usize) -> RowId {
        let source = parent.source_number() & ROOT_MASK;
        let seed = parent.0
            ^ (position as u64).rotate_left(40)
            ^ (ordinal as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let mut local = mix(seed) & LOCAL_MASK;

        let mut issued = scope.issued.lock();
        while !issued.insert(local) {
            local = (local + 1) & LOCAL_MASK;
        }
        self.derived.fetch_add(1, Ordering::Relaxed);
        RowId(VIRTUAL_BIT | (source << LOCAL_BITS) | local)
    }

    /// Number of virtual ids handed out so far.
    pub fn virtual_count(&self) -> u64 {
        self.derived.load(Ordering::Relaxed)
    }
}

/// Local parts already handed out to descendants of one source row.
#[derive(Debug, Default)]
pub struct IdScope {
    issued: Mutex<HashSet<u64>>,
}

impl IdScope {
    pub fn len(&self) -> usize {
        self.issued.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

struct RowData {
    id: RowId,
    parent: Option<InputRow>,
    values: Vec<(InputColumn, Value)>,
}

/// A row as seen by components.
///
/// Rows are immutable. Transformer outputs are layered on top of the row they
/// were computed from, so cloning and extending a row is cheap.
#[derive(Clone)]
pub struct InputRow(Arc<RowData>);

impl InputRow {
    pub fn new(id: RowId, values: Vec<(InputColumn, Value)>) -> Self {
        Self(Arc::new(RowData {
            id,
            parent: None,
            values,
        }))
    }

    /// A row with additional values layered over this one.
    pub fn extend(&self, id: RowId, values: Vec<(InputColumn, Value)>) -> Self {
        Self(Arc::new(RowData {
            id,
            parent: Some(self.clone()),
            values,
        }))
    }

    pub fn id(&self) -> RowId {
        self.0.id
    }

    /// The value of `column`, or null if the row does not carry it.
    pub fn value(&self, column: &InputColumn) -> &Value {
        let mut current = Some(self);
        while let Some(row) = current {
            if let Some((_, value)) = row.0.values.iter().find(|(c, _)| c == column) {
                return value;
            }
            current = row.0.parent.as_ref();
        }
        &NULL_VALUE
    }

    /// Values for several columns, in order.
    pub fn values(&self, columns: &[InputColumn]) -> Vec<Value> {
        columns.iter().map(|c| self.value(c).clone()).collect()
    }

    pub fn contains(&self, column: &InputColumn) -> bool {
        let mut current = Some(self);
        while let Some(row) = current {
            if row.0.values.iter().any(|(c, _)| c == column) {
                return true;
            }
            current = row.0.parent.as_ref();
        }
        false
    }

    /// All columns and values, oldest layer first.
    pub fn entries(&self) -> Vec<(InputColumn, Value)> {
        let mut layers = Vec::new();
        let mut current = Some(self);
        while let Some(row) = current {
            layers.push(&row.0.values);
            current = row.0.parent.as_ref();
        }

        let mut entries: IndexMap<InputColumn, Value> = IndexMap::new();
        for layer in layers.into_iter().rev() {
            for (column, value) in layer {
                entries.insert(column.clone(), value.clone());
            }
        }
        entries.into_iter().collect()
    }

    pub fn columns(&self) -> Vec<InputColumn> {
        self.entries().into_iter().map(|(c, _)| c).collect()
    }
}

impl PartialEq for InputRow {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.entries() == other.entries()
    }
}

impl fmt::Debug for InputRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<String> = self
            .entries()
            .into_iter()
            .map(|(c, v)| format!("{}={}", c, v))
            .collect();
        write!(f, "InputRow[id={},values=[{}]]", self.id(), values.join(","))
    }
}

impl Serialize for InputRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let values: IndexMap<String, Value> = self
            .entries()
            .into_iter()
            .map(|(c, v)| (c.name(), v))
            .collect();
        let mut state = serializer.serialize_struct("InputRow", 2)?;
        state.serialize_field("id", &self.id())?;
        state.serialize_field("values", &values)?;
        state.end()
    }
}
