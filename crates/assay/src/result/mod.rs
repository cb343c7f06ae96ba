//! Analyzer results and the reducers that merge partial results.

mod crosstab;
mod reducer;

pub use crosstab::{Crosstab, CrosstabDimension, CrosstabNavigator};
pub use reducer::{
    CombineKind, Combiner, DefaultResultReducer, ResultReducer, maximum, merge_crosstabs, minimum,
    sum_as_double, sum_as_integer,
};
pub(crate) use reducer::merge_annotated_rows;

use indexmap::IndexMap;
use serde::Serialize;

use crate::error::Result;
use crate::input::InputRow;
use crate::schema::Value;
use crate::storage::{RowAnnotation, RowAnnotationFactory};

/// Rows gathered under one annotation: the full weighted count plus a
/// materialized sample of at most `sample_size` rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotatedRows {
    pub row_count: u64,
    pub rows: Vec<InputRow>,
    pub sample_size: usize,
}

impl AnnotatedRows {
    pub fn from_annotation(
        annotation: &RowAnnotation,
        factory: &dyn RowAnnotationFactory,
    ) -> Result<Self> {
        Ok(Self {
            row_count: annotation.row_count(),
            rows: factory.rows(annotation)?,
            sample_size: factory.sample_size(),
        })
    }
}

/// The output of one analyzer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzerResult {
    /// Name of the component that produced the result.
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crosstab: Option<Crosstab>,
    pub metrics: IndexMap<String, Value>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub annotated_rows: IndexMap<String, AnnotatedRows>,
}

impl AnalyzerResult {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            crosstab: None,
            metrics: IndexMap::new(),
            annotated_rows: IndexMap::new(),
        }
    }

    pub fn with_crosstab(mut self, crosstab: Crosstab) -> Self {
        self.crosstab = Some(crosstab);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn with_annotated_rows(mut self, name: impl Into<String>, rows: AnnotatedRows) -> Self {
        self.annotated_rows.insert(name.into(), rows);
        self
    }

    pub fn metric(&self, name: &str) -> Option<&Value> {
        self.metrics.get(name)
    }

    /// Integer view of a metric, for the common count case.
    pub fn count(&self, name: &str) -> Option<i64> {
        self.metric(name).and_then(Value::as_i64)
    }
}
