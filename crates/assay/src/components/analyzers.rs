//! Result-producing analyzers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use super::{required_inputs, single_input};
use crate::descriptor::{
    Analyzer, Component, ComponentConfiguration, ComponentContext, ComponentDescriptor,
    ComponentFactory, InputSpec,
};
use crate::error::{AssayError, Result};
use crate::input::InputRow;
use crate::result::{
    AnalyzerResult, AnnotatedRows, Combiner, Crosstab, CrosstabDimension, DefaultResultReducer,
    ResultReducer, merge_annotated_rows, merge_crosstabs,
};
use crate::schema::{DataType, InputColumn, Value};
use crate::storage::{RowAnnotation, RowAnnotationFactory, StoredMap};

const MEASURE: &str = "Measure";
const COUNT: &str = "Count";
const NULL_COUNT: &str = "Null count";
const VALID_COUNT: &str = "Valid count";
const DISTINCT_COUNT: &str = "Distinct count";
const UNIQUE_COUNT: &str = "Unique count";
const TOTAL_COUNT: &str = "Total count";
const ROW_COUNT: &str = "Row count";
const INCOMPLETE_ROW_COUNT: &str = "Incomplete row count";

/// Annotation factory plus one annotation, set up during initialization.
struct Annotated {
    factory: Arc<dyn RowAnnotationFactory>,
    annotation: RowAnnotation,
}

impl Annotated {
    fn new(context: &ComponentContext) -> Self {
        let factory = context.annotations.clone();
        let annotation = factory.create_annotation();
        Self {
            factory,
            annotation,
        }
    }

    fn rows(&self) -> Result<AnnotatedRows> {
        AnnotatedRows::from_annotation(&self.annotation, self.factory.as_ref())
    }
}

fn not_initialized(component: &str) -> AssayError {
    AssayError::component(component, "analyzer used before initialization")
}

/// Counts the occurrences of each value of one column.
///
/// Counts live in a stored map, so a column with many distinct values
/// spills to disk instead of growing the heap.
pub struct ValueDistributionAnalyzer {
    name: String,
    column: InputColumn,
    counts: Option<Box<dyn StoredMap>>,
    nulls: Option<Annotated>,
    null_count: AtomicU64,
    total_count: AtomicU64,
}

impl ValueDistributionAnalyzer {
    pub fn new(column: InputColumn) -> Self {
        Self {
            name: "Value distribution".to_string(),
            column,
            counts: None,
            nulls: None,
            null_count: AtomicU64::new(0),
            total_count: AtomicU64::new(0),
        }
    }
}

impl Analyzer for ValueDistributionAnalyzer {
    fn initialize(&mut self, context: &ComponentContext) -> Result<()> {
        self.name = context.component_name.clone();
        self.counts = Some(context.storage.create_map()?);
        self.nulls = Some(Annotated::new(context));
        Ok(())
    }

    fn run(&self, row: &InputRow, distinct_count: u32) -> Result<()> {
        let (Some(counts), Some(nulls)) = (&self.counts, &self.nulls) else {
            return Err(not_initialized(&self.name));
        };
        let weight = distinct_count as u64;
        self.total_count.fetch_add(weight, Ordering::Relaxed);

        let value = row.value(&self.column);
        if value.is_null() {
            self.null_count.fetch_add(weight, Ordering::Relaxed);
            return nulls.factory.annotate(row, distinct_count, &nulls.annotation);
        }
        counts.update(value.clone(), &mut |current| {
            Value::Integer(current.and_then(|v| v.as_i64()).unwrap_or(0) + weight as i64)
        })?;
        Ok(())
    }

    fn result(&self) -> Result<AnalyzerResult> {
        let (Some(counts), Some(nulls)) = (&self.counts, &self.nulls) else {
            return Err(not_initialized(&self.name));
        };
        let mut entries: Vec<(String, i64)> = counts
            .entries()?
            .into_iter()
            .map(|(value, count)| (value.to_string(), count.as_i64().unwrap_or(0)))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut crosstab = value_crosstab();
        for (value, count) in &entries {
            crosstab.put(&[("Value", value.as_str()), (MEASURE, COUNT)], *count)?;
        }

        let result = AnalyzerResult::new(&self.name)
            .with_crosstab(crosstab)
            .with_metric(NULL_COUNT, self.null_count.load(Ordering::Acquire))
            .with_metric(TOTAL_COUNT, self.total_count.load(Ordering::Acquire))
            .with_annotated_rows("Null values", nulls.rows()?);
        Ok(with_distinct_metrics(result))
    }
}

fn value_crosstab() -> Crosstab {
    Crosstab::new(vec![
        CrosstabDimension::new("Value"),
        CrosstabDimension::new(MEASURE).with_categories([COUNT]),
    ])
}

/// Derive distinct and unique counts from the value crosstab.
fn with_distinct_metrics(mut result: AnalyzerResult) -> AnalyzerResult {
    let counts: Vec<i64> = result
        .crosstab
        .iter()
        .flat_map(|c| c.cells())
        .filter_map(|(_, v)| v.as_i64())
        .collect();
    let distinct = counts.len() as i64;
    let unique = counts.iter().filter(|c| **c == 1).count() as i64;
    result.metrics.insert(DISTINCT_COUNT.to_string(), Value::Integer(distinct));
    result.metrics.insert(UNIQUE_COUNT.to_string(), Value::Integer(unique));
    result
}

/// Sums value counts across partitions and recomputes the distinct and
/// unique counts from the merged distribution.
#[derive(Debug, Default, Clone, Copy)]
pub struct ValueDistributionReducer;

impl ResultReducer for ValueDistributionReducer {
    fn reduce(&self, partials: &[AnalyzerResult]) -> Result<AnalyzerResult> {
        let Some(first) = partials.first() else {
            return Err(AssayError::ResultShape("no partial results".to_string()));
        };
        let crosstabs: Vec<&Crosstab> = partials.iter().filter_map(|p| p.crosstab.as_ref()).collect();
        let crosstab = if crosstabs.is_empty() {
            value_crosstab()
        } else {
            merge_crosstabs(&crosstabs, &Combiner::sum())?
        };

        let sum = |metric: &str| -> i64 { partials.iter().filter_map(|p| p.count(metric)).sum() };
        let mut result = AnalyzerResult::new(first.component.clone())
            .with_crosstab(crosstab)
            .with_metric(NULL_COUNT, sum(NULL_COUNT))
            .with_metric(TOTAL_COUNT, sum(TOTAL_COUNT));
        result.annotated_rows = merge_annotated_rows(partials);
        Ok(with_distinct_metrics(result))
    }
}

pub struct ValueDistributionFactory {
    descriptor: ComponentDescriptor,
}

impl ValueDistributionFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::analyzer("Value distribution")
                .with_description("Counts the occurrences of each value")
                .with_input(InputSpec::exactly(DataType::Any, 1)),
        }
    }
}

impl Default for ValueDistributionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for ValueDistributionFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let column = single_input(&self.descriptor.name, config)?;
        Ok(Component::Analyzer(Box::new(ValueDistributionAnalyzer::new(
            column,
        ))))
    }

    fn reducer(&self) -> Option<Arc<dyn ResultReducer>> {
        Some(Arc::new(ValueDistributionReducer))
    }
}

/// Null and valid counts per column, plus the rows with any null.
pub struct CompletenessAnalyzer {
    name: String,
    columns: Vec<InputColumn>,
    nulls: Vec<AtomicU64>,
    rows: AtomicU64,
    incomplete: Option<Annotated>,
}

impl CompletenessAnalyzer {
    pub fn new(columns: Vec<InputColumn>) -> Self {
        let nulls = columns.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            name: "Completeness".to_string(),
            columns,
            nulls,
            rows: AtomicU64::new(0),
            incomplete: None,
        }
    }
}

impl Analyzer for CompletenessAnalyzer {
    fn initialize(&mut self, context: &ComponentContext) -> Result<()> {
        self.name = context.component_name.clone();
        self.incomplete = Some(Annotated::new(context));
        Ok(())
    }

    fn run(&self, row: &InputRow, distinct_count: u32) -> Result<()> {
        let Some(incomplete) = &self.incomplete else {
            return Err(not_initialized(&self.name));
        };
        let weight = distinct_count as u64;
        self.rows.fetch_add(weight, Ordering::Relaxed);

        let mut complete = true;
        for (column, nulls) in self.columns.iter().zip(&self.nulls) {
            if row.value(column).is_null() {
                nulls.fetch_add(weight, Ordering::Relaxed);
                complete = false;
            }
        }
        if !complete {
            incomplete
                .factory
                .annotate(row, distinct_count, &incomplete.annotation)?;
        }
        Ok(())
    }

    fn result(&self) -> Result<AnalyzerResult> {
        let Some(incomplete) = &self.incomplete else {
            return Err(not_initialized(&self.name));
        };
        let rows = self.rows.load(Ordering::Acquire);
        let mut crosstab = Crosstab::new(vec![
            CrosstabDimension::new("Column"),
            CrosstabDimension::new(MEASURE).with_categories([NULL_COUNT, VALID_COUNT]),
        ]);
        for (column, nulls) in self.columns.iter().zip(&self.nulls) {
            let name = column.name();
            let nulls = nulls.load(Ordering::Acquire);
            crosstab
                .at("Column", &name)
                .at(MEASURE, NULL_COUNT)
                .put(nulls)?;
            crosstab
                .at("Column", &name)
                .at(MEASURE, VALID_COUNT)
                .put(rows - nulls)?;
        }

        let incomplete_rows = incomplete.rows()?;
        Ok(AnalyzerResult::new(&self.name)
            .with_crosstab(crosstab)
            .with_metric(ROW_COUNT, rows)
            .with_metric(INCOMPLETE_ROW_COUNT, incomplete_rows.row_count)
            .with_annotated_rows("Incomplete rows", incomplete_rows))
    }
}

pub struct CompletenessFactory {
    descriptor: ComponentDescriptor,
}

impl CompletenessFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::analyzer("Completeness")
                .with_description("Counts null and valid values per column")
                .with_input(InputSpec::any(DataType::Any))
                .concurrent(true),
        }
    }
}

impl Default for CompletenessFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for CompletenessFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        let columns = required_inputs(&self.descriptor.name, config)?;
        Ok(Component::Analyzer(Box::new(CompletenessAnalyzer::new(
            columns,
        ))))
    }

    fn reducer(&self) -> Option<Arc<dyn ResultReducer>> {
        Some(Arc::new(DefaultResultReducer::new()))
    }
}

/// Annotates every row it receives.
pub struct RowCollectorAnalyzer {
    name: String,
    collected: Option<Annotated>,
}

impl RowCollectorAnalyzer {
    pub fn new() -> Self {
        Self {
            name: "Row collector".to_string(),
            collected: None,
        }
    }
}

impl Default for RowCollectorAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for RowCollectorAnalyzer {
    fn initialize(&mut self, context: &ComponentContext) -> Result<()> {
        self.name = context.component_name.clone();
        self.collected = Some(Annotated::new(context));
        Ok(())
    }

    fn run(&self, row: &InputRow, distinct_count: u32) -> Result<()> {
        let Some(collected) = &self.collected else {
            return Err(not_initialized(&self.name));
        };
        collected
            .factory
            .annotate(row, distinct_count, &collected.annotation)
    }

    fn result(&self) -> Result<AnalyzerResult> {
        let Some(collected) = &self.collected else {
            return Err(not_initialized(&self.name));
        };
        let rows = collected.rows()?;
        Ok(AnalyzerResult::new(&self.name)
            .with_metric(ROW_COUNT, rows.row_count)
            .with_annotated_rows("Rows", rows))
    }
}

pub struct RowCollectorFactory {
    descriptor: ComponentDescriptor,
}

impl RowCollectorFactory {
    pub fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::analyzer("Row collector")
                .with_description("Collects the rows that reach it")
                .with_input(InputSpec::any(DataType::Any))
                .concurrent(true),
        }
    }
}

impl Default for RowCollectorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentFactory for RowCollectorFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        required_inputs(&self.descriptor.name, config)?;
        Ok(Component::Analyzer(Box::new(RowCollectorAnalyzer::new())))
    }

    fn reducer(&self) -> Option<Arc<dyn ResultReducer>> {
        Some(Arc::new(DefaultResultReducer::new()))
    }
}

/// Value counts of a finished value distribution, most frequent first.
pub fn value_counts(result: &AnalyzerResult) -> IndexMap<String, i64> {
    result
        .crosstab
        .iter()
        .flat_map(|c| c.cells())
        .filter_map(|(key, v)| Some((key.first()?.clone(), v.as_i64()?)))
        .collect()
}
