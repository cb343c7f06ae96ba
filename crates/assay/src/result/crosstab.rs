//! Multi-dimensional tables of measures.

use indexmap::{IndexMap, IndexSet};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::error::{AssayError, Result};
use crate::schema::Value;

/// A named dimension and the categories seen along it, in first-use order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrosstabDimension {
    name: String,
    categories: IndexSet<String>,
}

impl CrosstabDimension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            categories: IndexSet::new(),
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for category in categories {
            self.categories.insert(category.into());
        }
        self
    }

    pub fn add_category(&mut self, category: impl Into<String>) {
        self.categories.insert(category.into());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.iter().map(String::as_str)
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories.contains(category)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// The standard analyzer result shape.
///
/// A cell is addressed by one category per dimension. Writing to a category
/// that the dimension does not know yet adds it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Crosstab {
    dimensions: Vec<CrosstabDimension>,
    #[serde(serialize_with = "serialize_cells")]
    cells: IndexMap<Vec<String>, Value>,
}

impl Crosstab {
    pub fn new(dimensions: Vec<CrosstabDimension>) -> Self {
        Self {
            dimensions,
            cells: IndexMap::new(),
        }
    }

    pub fn dimensions(&self) -> &[CrosstabDimension] {
        &self.dimensions
    }

    pub fn dimension(&self, name: &str) -> Option<&CrosstabDimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn dimension_names(&self) -> Vec<&str> {
        self.dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    /// Cell key in dimension order for the given coordinates.
    fn key(&self, coordinates: &[(&str, &str)]) -> Result<Vec<String>> {
        if coordinates.len() != self.dimensions.len() {
            return Err(AssayError::ResultShape(format!(
                "expected {} coordinates, got {}",
                self.dimensions.len(),
                coordinates.len()
            )));
        }
        self.dimensions
            .iter()
            .map(|dimension| {
                coordinates
                    .iter()
                    .find(|(name, _)| *name == dimension.name)
                    .map(|(_, category)| category.to_string())
                    .ok_or_else(|| {
                        AssayError::ResultShape(format!(
                            "no category given for dimension '{}'",
                            dimension.name
                        ))
                    })
            })
            .collect()
    }

    /// Store a value at the given (dimension, category) coordinates.
    pub fn put(&mut self, coordinates: &[(&str, &str)], value: impl Into<Value>) -> Result<()> {
        let key = self.key(coordinates)?;
        self.put_key(key, value.into());
        Ok(())
    }

    pub(crate) fn put_key(&mut self, key: Vec<String>, value: Value) {
        for (dimension, category) in self.dimensions.iter_mut().zip(&key) {
            dimension.add_category(category.as_str());
        }
        self.cells.insert(key, value);
    }

    pub fn get(&self, coordinates: &[(&str, &str)]) -> Option<&Value> {
        let key = self.key(coordinates).ok()?;
        self.cells.get(&key)
    }

    /// Start navigating to a cell.
    pub fn at(&mut self, dimension: &str, category: &str) -> CrosstabNavigator<'_> {
        CrosstabNavigator {
            crosstab: self,
            coordinates: vec![(dimension.to_string(), category.to_string())],
        }
    }

    /// Cells in insertion order, keyed by one category per dimension.
    pub fn cells(&self) -> impl Iterator<Item = (&[String], &Value)> {
        self.cells.iter().map(|(k, v)| (k.as_slice(), v))
    }

    pub(crate) fn cell(&self, key: &[String]) -> Option<&Value> {
        self.cells.get(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Builder-style cell addressing: `crosstab.at("Column", "a").at("Measure", "b").put(3)`.
pub struct CrosstabNavigator<'a> {
    crosstab: &'a mut Crosstab,
    coordinates: Vec<(String, String)>,
}

impl CrosstabNavigator<'_> {
    pub fn at(mut self, dimension: &str, category: &str) -> Self {
        self.coordinates.retain(|(d, _)| d != dimension);
        self.coordinates
            .push((dimension.to_string(), category.to_string()));
        self
    }

    pub fn put(self, value: impl Into<Value>) -> Result<()> {
        let coordinates: Vec<(&str, &str)> = self
            .coordinates
            .iter()
            .map(|(d, c)| (d.as_str(), c.as_str()))
            .collect();
        self.crosstab.put(&coordinates, value)
    }

    pub fn get(&self) -> Option<&Value> {
        let coordinates: Vec<(&str, &str)> = self
            .coordinates
            .iter()
            .map(|(d, c)| (d.as_str(), c.as_str()))
            .collect();
        self.crosstab.get(&coordinates)
    }
}

#[derive(Serialize)]
struct CellRef<'a> {
    categories: &'a [String],
    value: &'a Value,
}

fn serialize_cells<S: Serializer>(
    cells: &IndexMap<Vec<String>, Value>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(cells.len()))?;
    for (categories, value) in cells {
        seq.serialize_element(&CellRef { categories, value })?;
    }
    seq.end()
}
