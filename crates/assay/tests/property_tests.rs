//! Property-based tests for the job builder, row annotations, reducers and
//! multi-row execution.
//!
//! # Running Property Tests
//!
//! ```bash
//! cargo test -p assay --test property_tests
//!
//! # More cases (slower but more thorough)
//! PROPTEST_CASES=2000 cargo test -p assay --test property_tests
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use assay::job::ComponentJob;
use assay::result::{Combiner, CrosstabDimension, DefaultResultReducer, sum_as_integer};
use assay::schema::ColumnId;
use assay::storage::{InMemoryRowAnnotationFactory, RowAnnotationFactory};
use assay::{
    AnalysisJobBuilder, AnalysisRunner, AnalyzerResult, ComponentId, ComponentRegistry,
    ComponentRequirement, Crosstab, DataTable, DataType, EngineConfig, InputColumn, InputRow,
    MemoryDatastore, ResultReducer, RowId, Value,
};

// =============================================================================
// Test Strategies
// =============================================================================

/// One step of building a job.
#[derive(Debug, Clone)]
enum BuildStep {
    AddTransformer(usize),
    AddFilter(usize),
    Require { component: usize, filter: usize },
}

fn build_step() -> impl Strategy<Value = BuildStep> {
    prop_oneof![
        (0usize..64).prop_map(BuildStep::AddTransformer),
        (0usize..64).prop_map(BuildStep::AddFilter),
        (0usize..64, 0usize..64)
            .prop_map(|(component, filter)| BuildStep::Require { component, filter }),
    ]
}

/// Values with a healthy share of nulls.
fn nullable_integer() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        3 => (-1_000i64..1_000).prop_map(Value::Integer),
    ]
}

/// Space separated words, sometimes empty.
fn sentence() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-c]{1,3}", 0..4).prop_map(|words| words.join(" "))
}

fn dependencies(component: &ComponentJob) -> Vec<ComponentId> {
    let mut deps: Vec<ComponentId> = component
        .inputs()
        .iter()
        .filter_map(InputColumn::producer)
        .collect();
    if let Some(requirement) = component.requirement() {
        deps.extend(requirement.filters());
    }
    deps
}

fn metric_result(name: &str, crosstab_values: &[Value], metric: Value) -> AnalyzerResult {
    let mut crosstab = Crosstab::new(vec![CrosstabDimension::new("Cell")]);
    for (i, value) in crosstab_values.iter().enumerate() {
        crosstab
            .put(&[("Cell", i.to_string().as_str())], value.clone())
            .unwrap();
    }
    AnalyzerResult::new(name)
        .with_crosstab(crosstab)
        .with_metric("Total", metric)
}

// =============================================================================
// Job Builder Properties
// =============================================================================

proptest! {
    /// Whatever sequence of edits the builder accepts, the frozen job is
    /// acyclic and lists every component after everything it depends on.
    #[test]
    fn prop_builder_never_accepts_cycles(steps in prop::collection::vec(build_step(), 1..40)) {
        let mut builder = AnalysisJobBuilder::new(Arc::new(ComponentRegistry::with_builtins()));
        builder.add_source_column("a", DataType::String);
        builder.add_source_column("b", DataType::String);

        let mut components: Vec<ComponentId> = Vec::new();
        let mut filters: Vec<ComponentId> = Vec::new();
        for step in steps {
            match step {
                BuildStep::AddTransformer(pick) => {
                    let columns = builder.available_input_columns(None);
                    let input = columns[pick % columns.len()].clone();
                    let id = builder
                        .add_component_with("Concatenator", &[input], Vec::<(&str, _)>::new())
                        .unwrap();
                    components.push(id);
                }
                BuildStep::AddFilter(pick) => {
                    let columns = builder.available_input_columns(None);
                    let input = columns[pick % columns.len()].clone();
                    let id = builder
                        .add_component_with("Null check", &[input], Vec::<(&str, _)>::new())
                        .unwrap();
                    components.push(id);
                    filters.push(id);
                }
                BuildStep::Require { component, filter } => {
                    if components.is_empty() || filters.is_empty() {
                        continue;
                    }
                    let component = components[component % components.len()];
                    let filter = filters[filter % filters.len()];
                    // Rejected edits must leave the builder consistent.
                    let _ = builder.set_requirement(
                        component,
                        Some(ComponentRequirement::outcome(filter, "NOT_NULL")),
                    );
                }
            }
        }

        let job = builder.to_analysis_job().unwrap();
        prop_assert_eq!(job.components().len(), components.len());

        let positions: HashMap<ComponentId, usize> = job
            .components()
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id(), i))
            .collect();
        for (position, component) in job.components().iter().enumerate() {
            for dependency in dependencies(component) {
                prop_assert!(positions[&dependency] < position);
            }
        }
    }
}

// =============================================================================
// Row Annotation Properties
// =============================================================================

proptest! {
    /// Annotating a row again never changes the recorded count.
    #[test]
    fn prop_annotation_counts_each_row_once(
        annotations in prop::collection::vec((1u64..30, 1u32..5), 0..100),
        sample_size in 0usize..40,
    ) {
        let column = InputColumn::source(ColumnId(0), "c", DataType::String);
        let factory = InMemoryRowAnnotationFactory::new(sample_size);
        let annotation = factory.create_annotation();

        let mut first_counts: HashMap<u64, u32> = HashMap::new();
        for (id, count) in &annotations {
            let row = InputRow::new(RowId::physical(*id), vec![(column.clone(), Value::from("x"))]);
            factory.annotate(&row, *count, &annotation).unwrap();
            first_counts.entry(*id).or_insert(*count);
        }

        let expected: u64 = first_counts.values().map(|c| *c as u64).sum();
        prop_assert_eq!(annotation.row_count(), expected);

        let rows = factory.rows(&annotation).unwrap();
        prop_assert_eq!(rows.len(), first_counts.len().min(sample_size));
        let distinct: HashSet<RowId> = rows.iter().map(InputRow::id).collect();
        prop_assert_eq!(distinct.len(), rows.len());
    }
}

// =============================================================================
// Reducer Properties
// =============================================================================

proptest! {
    /// Integer sums skip nulls and are null only when nothing was summed.
    #[test]
    fn prop_sum_skips_nulls(values in prop::collection::vec(nullable_integer(), 0..20)) {
        let numbers: Vec<i64> = values.iter().filter_map(Value::as_i64).collect();
        let summed = sum_as_integer(&values);
        if numbers.is_empty() {
            prop_assert_eq!(summed, Value::Null);
        } else {
            prop_assert_eq!(summed, Value::Integer(numbers.iter().sum()));
        }
    }

    /// Reducing partials cell by cell gives the same totals as summing
    /// every partial by hand, whatever the partition sizes.
    #[test]
    fn prop_reducer_sums_partials(
        partials in prop::collection::vec(prop::collection::vec(0i64..100, 3), 1..6),
    ) {
        let results: Vec<AnalyzerResult> = partials
            .iter()
            .map(|cells| {
                let values: Vec<Value> = cells.iter().map(|c| Value::Integer(*c)).collect();
                metric_result("Counter", &values, Value::Integer(cells.iter().sum()))
            })
            .collect();

        let reduced = DefaultResultReducer::new()
            .with_crosstab_combiner(Combiner::sum())
            .reduce(&results)
            .unwrap();

        let crosstab = reduced.crosstab.as_ref().unwrap();
        for cell in 0..3 {
            let expected: i64 = partials.iter().map(|p| p[cell]).sum();
            let key = cell.to_string();
            prop_assert_eq!(crosstab.get(&[("Cell", key.as_str())]), Some(&Value::Integer(expected)));
        }
        let total: i64 = partials.iter().flatten().sum();
        prop_assert_eq!(reduced.count("Total"), Some(total));
    }
}

// =============================================================================
// Execution Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every row leaving a multi-row transformer has its own id, and rows
    /// that emit nothing never reach downstream components.
    #[test]
    fn prop_fan_out_ids_are_unique(
        texts in prop::collection::vec(sentence(), 1..30),
        concurrency in 1usize..4,
    ) {
        let rows: Vec<[&str; 1]> = texts.iter().map(|t| [t.as_str()]).collect();
        let slices: Vec<&[&str]> = rows.iter().map(|r| r.as_slice()).collect();
        let datastore = MemoryDatastore::new("sentences", DataTable::from_strings(&["text"], &slices));

        let mut builder = AnalysisJobBuilder::new(Arc::new(ComponentRegistry::with_builtins()));
        let columns = builder.set_datastore(&datastore).unwrap();
        let splitter = builder
            .add_component_with("Token splitter", &columns, vec![("Delimiters", json!(" "))])
            .unwrap();
        let token = builder.component(splitter).unwrap().outputs()[0].clone();
        builder
            .add_component_with("Row collector", &[token], Vec::<(&str, _)>::new())
            .unwrap();

        let mut config = EngineConfig::default().with_concurrency(concurrency);
        config.storage.annotation_sample_size = 1_000;
        let future = AnalysisRunner::new(config)
            .run(Arc::new(builder.to_analysis_job().unwrap()), Arc::new(datastore));
        prop_assert!(future.is_successful());

        let expected: usize = texts.iter().map(|t| t.split_whitespace().count()).sum();
        let collected = future.result_for("Row collector").unwrap();
        let ids: Vec<RowId> = collected.annotated_rows["Rows"].rows.iter().map(InputRow::id).collect();
        prop_assert_eq!(ids.len(), expected);
        prop_assert_eq!(ids.iter().collect::<HashSet<_>>().len(), expected);
        prop_assert!(ids.iter().all(RowId::is_virtual));
    }
}
