//! The per-row contracts components implement.

use std::fmt;
use std::sync::Arc;

use super::{ComponentConfiguration, ComponentDescriptor};
use crate::error::{AssayError, Result};
use crate::input::InputRow;
use crate::result::{AnalyzerResult, ResultReducer};
use crate::schema::{DataType, Value};
use crate::storage::{RowAnnotationFactory, StorageProvider};

/// Services available to a component while it initializes.
#[derive(Clone)]
pub struct ComponentContext {
    /// Display name of the component job.
    pub component_name: String,
    pub storage: Arc<dyn StorageProvider>,
    pub annotations: Arc<dyn RowAnnotationFactory>,
}

impl fmt::Debug for ComponentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentContext")
            .field("component_name", &self.component_name)
            .finish_non_exhaustive()
    }
}

/// Categorizes each row into one of the descriptor's outcome categories.
pub trait Filter: Send + Sync {
    fn initialize(&mut self, _context: &ComponentContext) -> Result<()> {
        Ok(())
    }

    fn categorize(&self, row: &InputRow) -> Result<String>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Derives generated columns from each row.
///
/// Values are written to the collector, one `emit` per output row. A
/// transformer that is not declared multi-row emits at most once; emitting
/// nothing leaves its output columns null.
pub trait Transformer: Send + Sync {
    fn initialize(&mut self, _context: &ComponentContext) -> Result<()> {
        Ok(())
    }

    fn transform(&self, row: &InputRow, out: &mut OutputRowCollector) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Accumulates the rows it receives into one result.
pub trait Analyzer: Send + Sync {
    fn initialize(&mut self, _context: &ComponentContext) -> Result<()> {
        Ok(())
    }

    /// Consume a row standing for `distinct_count` identical source rows.
    fn run(&self, row: &InputRow, distinct_count: u32) -> Result<()>;

    fn result(&self) -> Result<AnalyzerResult>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A component instance.
pub enum Component {
    Filter(Box<dyn Filter>),
    Transformer(Box<dyn Transformer>),
    Analyzer(Box<dyn Analyzer>),
}

impl Component {
    pub fn initialize(&mut self, context: &ComponentContext) -> Result<()> {
        match self {
            Component::Filter(f) => f.initialize(context),
            Component::Transformer(t) => t.initialize(context),
            Component::Analyzer(a) => a.initialize(context),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            Component::Filter(f) => f.close(),
            Component::Transformer(t) => t.close(),
            Component::Analyzer(a) => a.close(),
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Component::Filter(_) => "Filter",
            Component::Transformer(_) => "Transformer",
            Component::Analyzer(_) => "Analyzer",
        };
        write!(f, "Component::{}", kind)
    }
}

/// A generated column declared by a transformer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputColumnSpec {
    pub name: String,
    pub data_type: DataType,
}

impl OutputColumnSpec {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Receives the rows a transformer emits for one input row.
#[derive(Debug)]
pub struct OutputRowCollector {
    width: usize,
    rows: Vec<Vec<Value>>,
}

impl OutputRowCollector {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            rows: Vec::new(),
        }
    }

    /// Emit one row of output values, in output column order.
    pub fn emit(&mut self, values: Vec<Value>) -> Result<()> {
        if values.len() != self.width {
            return Err(AssayError::component(
                "output collector",
                format!("emitted {} values for {} output columns", values.len(), self.width),
            ));
        }
        self.rows.push(values);
        Ok(())
    }

    pub fn emitted(&self) -> usize {
        self.rows.len()
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }
}

/// Describes and instantiates one component implementation.
pub trait ComponentFactory: Send + Sync {
    fn descriptor(&self) -> &ComponentDescriptor;

    /// Generated columns for a configuration (transformers only).
    fn output_columns(&self, _config: &ComponentConfiguration) -> Vec<OutputColumnSpec> {
        Vec::new()
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component>;

    /// Merges partial results of this analyzer, when it can be partitioned.
    fn reducer(&self) -> Option<Arc<dyn ResultReducer>> {
        None
    }
}

impl fmt::Debug for dyn ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentFactory({})", self.descriptor().name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_checks_width() {
        let mut out = OutputRowCollector::new(2);
        out.emit(vec![Value::from("a"), Value::Null]).unwrap();
        assert!(out.emit(vec![Value::from("a")]).is_err());
        assert_eq!(out.emitted(), 1);
        assert_eq!(out.into_rows(), vec![vec![Value::from("a"), Value::Null]]);
    }
}
