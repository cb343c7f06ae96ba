//! Input columns: physical source columns and columns generated by transformers.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize, Serializer};

use super::types::DataType;
use crate::job::ComponentId;

/// Stable identity of a column within one job builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnId(pub u64);

/// Where the values of a column come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnOrigin {
    /// Read from the datastore.
    Source,
    /// Produced by the transformer with this id.
    Generated(ComponentId),
}

#[derive(Debug)]
struct ColumnInner {
    id: ColumnId,
    name: RwLock<String>,
    data_type: DataType,
    origin: ColumnOrigin,
}

/// A column that components can consume.
///
/// Cheap to clone. Equality and hashing use the column id only, so a
/// generated column keeps its identity when it is renamed.
#[derive(Clone)]
pub struct InputColumn(Arc<ColumnInner>);

impl InputColumn {
    /// Create a source column.
    pub fn source(id: ColumnId, name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(id, name, data_type, ColumnOrigin::Source)
    }

    /// Create a column generated by a transformer.
    pub fn generated(
        id: ColumnId,
        name: impl Into<String>,
        data_type: DataType,
        producer: ComponentId,
    ) -> Self {
        Self::new(id, name, data_type, ColumnOrigin::Generated(producer))
    }

    fn new(id: ColumnId, name: impl Into<String>, data_type: DataType, origin: ColumnOrigin) -> Self {
        Self(Arc::new(ColumnInner {
            id,
            name: RwLock::new(name.into()),
            data_type,
            origin,
        }))
    }

    pub fn id(&self) -> ColumnId {
        self.0.id
    }

    pub fn name(&self) -> String {
        self.0.name.read().clone()
    }

    /// Rename a generated column. Source column names are fixed by the datastore.
    pub fn set_name(&self, name: impl Into<String>) {
        if self.is_generated() {
            *self.0.name.write() = name.into();
        }
    }

    pub fn data_type(&self) -> DataType {
        self.0.data_type
    }

    pub fn origin(&self) -> ColumnOrigin {
        self.0.origin
    }

    pub fn is_generated(&self) -> bool {
        matches!(self.0.origin, ColumnOrigin::Generated(_))
    }

    /// The transformer that produces this column, if any.
    pub fn producer(&self) -> Option<ComponentId> {
        match self.0.origin {
            ColumnOrigin::Generated(id) => Some(id),
            ColumnOrigin::Source => None,
        }
    }

    /// A detached copy with the same identity, used when a job is frozen so
    /// later renames in the builder do not leak into the job.
    pub fn snapshot(&self) -> Self {
        Self::new(self.id(), self.name(), self.data_type(), self.origin())
    }
}

impl PartialEq for InputColumn {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for InputColumn {}

impl Hash for InputColumn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for InputColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputColumn")
            .field("id", &self.0.id.0)
            .field("name", &*self.0.name.read())
            .field("data_type", &self.0.data_type)
            .field("origin", &self.0.origin)
            .finish()
    }
}

impl fmt::Display for InputColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name.read())
    }
}

impl Serialize for InputColumn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}
