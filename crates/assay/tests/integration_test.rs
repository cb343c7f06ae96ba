//! End-to-end tests: build jobs, run them and inspect the results.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::{NamedTempFile, TempDir};
use tracing_subscriber::EnvFilter;

use assay::components::value_counts;
use assay::descriptor::{ComponentConfiguration, InputSpec, OutputColumnSpec};
use assay::job::ComponentJob;
use assay::{
    AnalysisJob, AnalysisJobBuilder, AnalysisListener, AnalysisResultFuture, AnalysisRunner,
    Analyzer, AnalyzerResult, AssayError, Component, ComponentDescriptor, ComponentFactory,
    ComponentRegistry, ComponentRequirement, ConfigurationError, CsvDatastore, DataTable,
    DataType, EngineConfig, ErrorPolicy, Filter, FilterOutcome, InputColumn, InputRow, JobStatus,
    MemoryDatastore, OutputRowCollector, PartitionedAnalysisRunner, Result, RowId,
    StorageBackend, Transformer, Value,
};
use assay::input::SourceColumn;

/// Route engine logs to the test output. Set `RUST_LOG=assay=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Helper to create a temporary file with given content.
fn create_test_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write to temp file");
    file
}

fn no_properties() -> Vec<(&'static str, serde_json::Value)> {
    Vec::new()
}

fn builder_for(
    registry: ComponentRegistry,
    datastore: &MemoryDatastore,
) -> (AnalysisJobBuilder, Vec<InputColumn>) {
    let mut builder = AnalysisJobBuilder::new(Arc::new(registry)).with_name("test job");
    let columns = builder.set_datastore(datastore).unwrap();
    (builder, columns)
}

fn run(job: AnalysisJob, datastore: MemoryDatastore, config: EngineConfig) -> AnalysisResultFuture {
    AnalysisRunner::new(config).run(Arc::new(job), Arc::new(datastore))
}

fn cell(result: &AnalyzerResult, column: &str, measure: &str) -> Option<i64> {
    result
        .crosstab
        .as_ref()?
        .get(&[("Column", column), ("Measure", measure)])?
        .as_i64()
}

fn collected_ids(result: &AnalyzerResult) -> Vec<RowId> {
    let mut ids: Vec<RowId> = result.annotated_rows["Rows"]
        .rows
        .iter()
        .map(InputRow::id)
        .collect();
    ids.sort();
    ids
}

fn numbers(count: usize) -> MemoryDatastore {
    let rows: Vec<Vec<String>> = (1..=count)
        .map(|i| vec![i.to_string(), format!("word{} extra{}", i % 7, i % 3)])
        .collect();
    let refs: Vec<Vec<&str>> = rows
        .iter()
        .map(|r| r.iter().map(String::as_str).collect())
        .collect();
    let slices: Vec<&[&str]> = refs.iter().map(Vec::as_slice).collect();
    MemoryDatastore::new("numbers", DataTable::from_strings(&["number", "text"], &slices))
}

// =============================================================================
// Test components
// =============================================================================

/// Categorizes a numeric text value as EVEN or ODD.
struct EvenOddFilter {
    column: InputColumn,
}

impl Filter for EvenOddFilter {
    fn categorize(&self, row: &InputRow) -> Result<String> {
        let number: i64 = row
            .value(&self.column)
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| AssayError::component("Even odd", "not a number"))?;
        Ok(if number % 2 == 0 { "EVEN" } else { "ODD" }.to_string())
    }
}

struct EvenOddFactory {
    descriptor: ComponentDescriptor,
}

impl EvenOddFactory {
    fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::filter("Even odd", ["EVEN", "ODD"])
                .with_input(InputSpec::exactly(DataType::Any, 1))
                .concurrent(true),
        }
    }
}

impl ComponentFactory for EvenOddFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        Ok(Component::Filter(Box::new(EvenOddFilter {
            column: config.inputs[0].clone(),
        })))
    }
}

/// Fails on every row whose value is in `failing`, and panics on "boom".
struct FlakyTransformer {
    column: InputColumn,
    failing: HashSet<String>,
}

impl Transformer for FlakyTransformer {
    fn transform(&self, row: &InputRow, out: &mut OutputRowCollector) -> Result<()> {
        let value = row.value(&self.column).as_str().unwrap_or_default().to_string();
        if value == "boom" {
            panic!("exploded on {}", value);
        }
        if self.failing.contains(&value) {
            return Err(AssayError::component("Flaky", format!("cannot handle {}", value)));
        }
        out.emit(vec![Value::from(value)])
    }
}

struct FlakyFactory {
    descriptor: ComponentDescriptor,
    failing: Vec<&'static str>,
}

impl FlakyFactory {
    fn new(failing: Vec<&'static str>) -> Self {
        Self {
            descriptor: ComponentDescriptor::transformer("Flaky")
                .with_input(InputSpec::exactly(DataType::Any, 1))
                .concurrent(true),
            failing,
        }
    }
}

impl ComponentFactory for FlakyFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn output_columns(&self, _config: &ComponentConfiguration) -> Vec<OutputColumnSpec> {
        vec![OutputColumnSpec::new("Flaky out", DataType::String)]
    }

    fn create(&self, config: &ComponentConfiguration) -> Result<Component> {
        Ok(Component::Transformer(Box::new(FlakyTransformer {
            column: config.inputs[0].clone(),
            failing: self.failing.iter().map(|s| s.to_string()).collect(),
        })))
    }
}

/// Sleeps on every row. Has no reducer.
struct SlowAnalyzer {
    seen: AtomicUsize,
}

impl Analyzer for SlowAnalyzer {
    fn run(&self, _row: &InputRow, _distinct_count: u32) -> Result<()> {
        thread::sleep(Duration::from_millis(2));
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn result(&self) -> Result<AnalyzerResult> {
        Ok(AnalyzerResult::new("Slow").with_metric("Seen", self.seen.load(Ordering::SeqCst) as i64))
    }
}

struct SlowFactory {
    descriptor: ComponentDescriptor,
}

impl SlowFactory {
    fn new() -> Self {
        Self {
            descriptor: ComponentDescriptor::analyzer("Slow")
                .with_input(InputSpec::any(DataType::Any)),
        }
    }
}

impl ComponentFactory for SlowFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, _config: &ComponentConfiguration) -> Result<Component> {
        Ok(Component::Analyzer(Box::new(SlowAnalyzer {
            seen: AtomicUsize::new(0),
        })))
    }
}

/// Tracks how many of its calls ever ran at the same time.
struct InFlightAnalyzer {
    current: AtomicUsize,
    peak: AtomicUsize,
    seen: AtomicUsize,
}

impl Analyzer for InFlightAnalyzer {
    fn run(&self, _row: &InputRow, _distinct_count: u32) -> Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_micros(200));
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn result(&self) -> Result<AnalyzerResult> {
        Ok(AnalyzerResult::new("In flight")
            .with_metric("Peak", self.peak.load(Ordering::SeqCst) as i64)
            .with_metric("Seen", self.seen.load(Ordering::SeqCst) as i64))
    }
}

struct InFlightFactory {
    descriptor: ComponentDescriptor,
}

impl InFlightFactory {
    fn new(name: &str, concurrent: bool) -> Self {
        Self {
            descriptor: ComponentDescriptor::analyzer(name)
                .with_input(InputSpec::any(DataType::Any))
                .concurrent(concurrent),
        }
    }
}

impl ComponentFactory for InFlightFactory {
    fn descriptor(&self) -> &ComponentDescriptor {
        &self.descriptor
    }

    fn create(&self, _config: &ComponentConfiguration) -> Result<Component> {
        Ok(Component::Analyzer(Box::new(InFlightAnalyzer {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        })))
    }
}

#[derive(Default)]
struct RecordingListener {
    begins: AtomicUsize,
    successes: AtomicUsize,
    closed: AtomicUsize,
    errors: AtomicUsize,
}

impl AnalysisListener for RecordingListener {
    fn job_begin(&self, _job: &AnalysisJob) {
        self.begins.fetch_add(1, Ordering::SeqCst);
    }

    fn job_success(&self, _job: &AnalysisJob, _rows: u64) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    fn component_success(&self, _job: &AnalysisJob, _component: &ComponentJob, _result: Option<&AnalyzerResult>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn error_in_component(
        &self,
        _job: &AnalysisJob,
        _component: &ComponentJob,
        _row_id: Option<RowId>,
        _error: &AssayError,
    ) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Name standardization scenario
// =============================================================================

#[test]
fn test_name_standardizer_feeds_analyzers() {
    init_tracing();
    let datastore = MemoryDatastore::new(
        "people",
        DataTable::from_strings(
            &["name"],
            &[&["Doh, John Doe"], &["John Doe"], &["Mr. John Doe"]],
        ),
    );
    let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);

    let standardizer = builder
        .add_component_with("Name standardizer", &columns, no_properties())
        .unwrap();
    let outputs = builder.component(standardizer).unwrap().outputs().to_vec();
    assert_eq!(outputs.len(), 4);
    let names: Vec<String> = outputs.iter().map(|c| c.name()).collect();
    assert_eq!(names, vec!["Firstname", "Lastname", "Middlename", "Titulation"]);

    builder
        .add_component_with("Completeness", &outputs, no_properties())
        .unwrap();
    let titles = builder
        .add_component_with("Value distribution", &outputs[3..], no_properties())
        .unwrap();
    builder.set_component_name(titles, "Titles").unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::default().with_concurrency(2),
    );
    assert!(future.is_successful(), "errors: {:?}", future.errors());

    let completeness = future.result_for("Completeness").unwrap();
    assert_eq!(cell(&completeness, "Firstname", "Null count"), Some(0));
    assert_eq!(cell(&completeness, "Lastname", "Null count"), Some(0));
    assert_eq!(cell(&completeness, "Middlename", "Null count"), Some(2));
    assert_eq!(cell(&completeness, "Titulation", "Null count"), Some(2));
    assert_eq!(cell(&completeness, "Titulation", "Valid count"), Some(1));

    let titles = future.result_for("Titles").unwrap();
    assert_eq!(titles.count("Null count"), Some(2));
    assert_eq!(value_counts(&titles).get("Mr"), Some(&1));
}

// =============================================================================
// Requirement routing
// =============================================================================

#[test]
fn test_filter_outcomes_gate_branches() {
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(EvenOddFactory::new());
    let datastore = numbers(10);
    let (mut builder, columns) = builder_for(registry, &datastore);
    let number = columns[0].clone();

    let filter = builder
        .add_component_with("Even odd", &[number.clone()], no_properties())
        .unwrap();

    // Transformer gated on EVEN; its consumer inherits the gate.
    let concat = builder
        .add_component_with("Concatenator", &[number.clone()], no_properties())
        .unwrap();
    builder
        .set_requirement(concat, Some(ComponentRequirement::outcome(filter, "EVEN")))
        .unwrap();
    let concat_out = builder.component(concat).unwrap().outputs()[0].clone();
    let evens = builder
        .add_component_with("Value distribution", &[concat_out], no_properties())
        .unwrap();
    builder.set_component_name(evens, "Evens").unwrap();

    let odds = builder
        .add_component_with("Row collector", &[number.clone()], no_properties())
        .unwrap();
    builder.set_component_name(odds, "Odds").unwrap();
    builder
        .set_requirement(odds, Some(ComponentRequirement::outcome(filter, "ODD")))
        .unwrap();

    let either = builder
        .add_component_with("Row collector", &[number.clone()], no_properties())
        .unwrap();
    builder.set_component_name(either, "Either").unwrap();
    builder
        .set_requirement(
            either,
            Some(ComponentRequirement::Compound(vec![
                FilterOutcome::new(filter, "EVEN"),
                FilterOutcome::new(filter, "ODD"),
            ])),
        )
        .unwrap();

    builder
        .add_component_with("Completeness", &[number], no_properties())
        .unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::default().with_concurrency(3),
    );
    assert_eq!(future.wait(), JobStatus::Successful);

    let evens = future.result_for("Evens").unwrap();
    assert_eq!(evens.count("Total count"), Some(5));
    assert_eq!(evens.count("Null count"), Some(0));
    assert_eq!(value_counts(&evens).get("4"), Some(&1));
    assert_eq!(value_counts(&evens).get("3"), None);

    assert_eq!(future.result_for("Odds").unwrap().count("Row count"), Some(5));
    assert_eq!(future.result_for("Either").unwrap().count("Row count"), Some(10));
    assert_eq!(future.result_for("Completeness").unwrap().count("Row count"), Some(10));
}

#[test]
fn test_default_requirement_gates_later_components() {
    let datastore = MemoryDatastore::new(
        "people",
        DataTable::from_strings(&["name", "city"], &[&["Ann", "Oslo"], &["", "Rome"], &["Bob", ""]]),
    );
    let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);
    let name = columns[0].clone();

    let before = builder
        .add_component_with("Row collector", &[name.clone()], no_properties())
        .unwrap();
    builder.set_component_name(before, "Before").unwrap();

    let filter = builder
        .add_component_with("Null check", &[name.clone()], no_properties())
        .unwrap();
    builder
        .set_default_requirement(Some(FilterOutcome::new(filter, "NOT_NULL")))
        .unwrap();
    let after = builder
        .add_component_with("Row collector", &[name], no_properties())
        .unwrap();
    builder.set_component_name(after, "After").unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::single_threaded(),
    );
    assert!(future.is_successful());
    assert_eq!(future.result_for("Before").unwrap().count("Row count"), Some(3));
    assert_eq!(future.result_for("After").unwrap().count("Row count"), Some(2));
}

// =============================================================================
// Scheduling
// =============================================================================

fn fan_out_job(datastore: &MemoryDatastore) -> AnalysisJob {
    let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), datastore);
    let number = columns[0].clone();
    let text = columns[1].clone();

    builder
        .add_component_with("Completeness", &[number, text.clone()], no_properties())
        .unwrap();
    let nulls = builder
        .add_component_with("Null check", &[text.clone()], no_properties())
        .unwrap();
    let splitter = builder
        .add_component_with("Token splitter", &[text.clone()], no_properties())
        .unwrap();
    builder
        .set_requirement(splitter, Some(ComponentRequirement::outcome(nulls, "NOT_NULL")))
        .unwrap();
    let token = builder.component(splitter).unwrap().outputs()[0].clone();

    builder
        .add_component_with("Value distribution", &[token.clone()], no_properties())
        .unwrap();
    builder
        .add_component_with("Row collector", &[token], no_properties())
        .unwrap();
    builder.to_analysis_job().unwrap()
}

fn small_sample_config(concurrency: usize) -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_concurrency(concurrency)
        .with_storage_backend(StorageBackend::Memory)
        .with_max_in_flight_rows(16);
    config.storage.annotation_sample_size = 10_000;
    config
}

#[test]
fn test_single_and_multi_threaded_runs_agree() {
    init_tracing();
    let datastore = numbers(300);
    let job = fan_out_job(&datastore);

    let single = AnalysisRunner::new(small_sample_config(1))
        .run(Arc::new(fan_out_job(&datastore)), Arc::new(datastore.clone()));
    let multi = AnalysisRunner::new(small_sample_config(4))
        .run(Arc::new(job), Arc::new(datastore));

    assert!(single.is_successful());
    assert!(multi.is_successful());

    let single = single.results_map();
    let multi = multi.results_map();
    assert_eq!(single.len(), 3);
    for (name, expected) in &single {
        let actual = &multi[name];
        assert_eq!(actual.crosstab, expected.crosstab, "crosstab of {}", name);
        assert_eq!(actual.metrics, expected.metrics, "metrics of {}", name);
    }

    let single_ids = collected_ids(&single["Row collector"]);
    let multi_ids = collected_ids(&multi["Row collector"]);
    assert_eq!(single_ids.len(), 600);
    assert_eq!(single_ids, multi_ids);
}

#[test]
fn test_non_concurrent_components_run_one_row_at_a_time() {
    init_tracing();
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(InFlightFactory::new("Serial", false));
    registry.register(InFlightFactory::new("Parallel", true));
    let datastore = numbers(400);
    let (mut builder, columns) = builder_for(registry, &datastore);
    builder
        .add_component_with("Serial", &columns, no_properties())
        .unwrap();
    builder
        .add_component_with("Parallel", &columns, no_properties())
        .unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::default()
            .with_concurrency(4)
            .with_storage_backend(StorageBackend::Memory),
    );
    assert!(future.is_successful(), "errors: {:?}", future.errors());

    let serial = future.result_for("Serial").unwrap();
    assert_eq!(serial.count("Seen"), Some(400));
    assert_eq!(serial.count("Peak"), Some(1));

    let parallel = future.result_for("Parallel").unwrap();
    assert_eq!(parallel.count("Seen"), Some(400));
    assert!(parallel.count("Peak").unwrap() >= 1);
}

#[test]
fn test_fan_out_rows_get_unique_virtual_ids() {
    let datastore = MemoryDatastore::new(
        "pairs",
        DataTable::from_strings(&["text"], &[&["a-b c-d"], &["e"], &[""], &["f-g"]]),
    );
    let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);

    let first = builder
        .add_component_with("Token splitter", &columns, no_properties())
        .unwrap();
    let token = builder.component(first).unwrap().outputs()[0].clone();
    let second = builder
        .add_component_with("Token splitter", &[token], vec![("Delimiters", json!("-"))])
        .unwrap();
    let part = builder.component(second).unwrap().outputs()[0].clone();
    builder
        .add_component_with("Row collector", &[part.clone()], no_properties())
        .unwrap();
    builder
        .add_component_with("Value distribution", &[part], no_properties())
        .unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::default().with_concurrency(4),
    );
    assert!(future.is_successful());

    let rows = future.result_for("Row collector").unwrap();
    let ids = collected_ids(&rows);
    assert_eq!(ids.len(), 7);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 7);
    assert!(ids.iter().all(RowId::is_virtual));

    let parts = value_counts(&future.result_for("Value distribution").unwrap());
    let mut letters: Vec<&str> = parts.keys().map(String::as_str).collect();
    letters.sort();
    assert_eq!(letters, vec!["a", "b", "c", "d", "e", "f", "g"]);
}

#[test]
fn test_collapsed_rows_are_weighted() {
    let table = DataTable::from_strings(
        &["city"],
        &[&["Oslo"], &["Rome"], &["Oslo"], &["Oslo"], &[""]],
    )
    .collapse_duplicates();
    let datastore = MemoryDatastore::new("cities", table);
    let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);
    builder
        .add_component_with("Value distribution", &columns, no_properties())
        .unwrap();
    builder
        .add_component_with("Completeness", &columns, no_properties())
        .unwrap();

    let future = run(builder.to_analysis_job().unwrap(), datastore, EngineConfig::default());
    let distribution = future.result_for("Value distribution").unwrap();
    assert_eq!(value_counts(&distribution).get("Oslo"), Some(&3));
    assert_eq!(distribution.count("Total count"), Some(5));
    assert_eq!(future.result_for("Completeness").unwrap().count("Row count"), Some(5));
}

#[test]
fn test_cancellation_settles_quickly() {
    init_tracing();
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(SlowFactory::new());
    let datastore = numbers(5_000);
    let (mut builder, columns) = builder_for(registry, &datastore);
    builder
        .add_component_with("Slow", &columns, no_properties())
        .unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::default().with_concurrency(2),
    );
    thread::sleep(Duration::from_millis(50));
    assert!(!future.is_done());
    future.cancel();

    assert_eq!(future.wait_timeout(Duration::from_secs(10)), JobStatus::Cancelled);
    assert!(future.is_cancelled());
    assert!(future.results().is_empty());
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_component_errors_are_collected() {
    init_tracing();
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(FlakyFactory::new(vec!["3", "7"]));
    let datastore = numbers(10);
    let (mut builder, columns) = builder_for(registry, &datastore);

    let flaky = builder
        .add_component_with("Flaky", &columns[..1], no_properties())
        .unwrap();
    let out = builder.component(flaky).unwrap().outputs()[0].clone();
    builder
        .add_component_with("Completeness", &[out], no_properties())
        .unwrap();

    let listener = Arc::new(RecordingListener::default());
    let future = AnalysisRunner::new(EngineConfig::default().with_concurrency(2))
        .with_listener(listener.clone())
        .run(Arc::new(builder.to_analysis_job().unwrap()), Arc::new(datastore));

    assert_eq!(future.wait(), JobStatus::Errornous);
    let errors = future.errors();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.component.as_deref() == Some("Flaky")));
    let mut failed: Vec<RowId> = errors.iter().filter_map(|e| e.row_id).collect();
    failed.sort();
    assert_eq!(failed, vec![RowId::physical(3), RowId::physical(7)]);

    // Failed rows continue with null outputs.
    let completeness = future.result_for("Completeness").unwrap();
    assert_eq!(cell(&completeness, "Flaky out", "Null count"), Some(2));
    assert_eq!(cell(&completeness, "Flaky out", "Valid count"), Some(8));

    assert_eq!(listener.begins.load(Ordering::SeqCst), 1);
    assert_eq!(listener.successes.load(Ordering::SeqCst), 1);
    assert_eq!(listener.closed.load(Ordering::SeqCst), 2);
    assert_eq!(listener.errors.load(Ordering::SeqCst), 2);
}

#[test]
fn test_panics_become_component_errors() {
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(FlakyFactory::new(vec![]));
    let datastore = MemoryDatastore::new(
        "words",
        DataTable::from_strings(&["word"], &[&["fine"], &["boom"], &["ok"]]),
    );
    let (mut builder, columns) = builder_for(registry, &datastore);
    let flaky = builder
        .add_component_with("Flaky", &columns, no_properties())
        .unwrap();
    let out = builder.component(flaky).unwrap().outputs()[0].clone();
    builder
        .add_component_with("Row collector", &[out], no_properties())
        .unwrap();

    let future = run(builder.to_analysis_job().unwrap(), datastore, EngineConfig::single_threaded());
    assert_eq!(future.wait(), JobStatus::Errornous);
    let errors = future.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error.to_string().contains("panicked"));
    assert_eq!(future.result_for("Row collector").unwrap().count("Row count"), Some(3));
}

#[test]
fn test_abort_on_first_error_stops_reading() {
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(FlakyFactory::new(vec!["3"]));
    let datastore = numbers(50);
    let (mut builder, columns) = builder_for(registry, &datastore);
    let flaky = builder
        .add_component_with("Flaky", &columns[..1], no_properties())
        .unwrap();
    let out = builder.component(flaky).unwrap().outputs()[0].clone();
    builder
        .add_component_with("Row collector", &[out], no_properties())
        .unwrap();

    let future = run(
        builder.to_analysis_job().unwrap(),
        datastore,
        EngineConfig::single_threaded().with_error_policy(ErrorPolicy::AbortOnFirstError),
    );
    assert_eq!(future.wait(), JobStatus::Errornous);
    assert_eq!(future.errors().len(), 1);
    let collected = future.result_for("Row collector").unwrap().count("Row count").unwrap();
    assert_eq!(collected, 2);
}

#[test]
fn test_missing_source_column_fails_execution() {
    let datastore = MemoryDatastore::new("a", DataTable::from_strings(&["x"], &[&["1"]]));
    let mut builder = AnalysisJobBuilder::new(Arc::new(ComponentRegistry::with_builtins()));
    let missing = builder.add_source_column("y", DataType::String);
    builder
        .add_component_with("Completeness", &[missing], no_properties())
        .unwrap();

    let future = run(builder.to_analysis_job().unwrap(), datastore, EngineConfig::default());
    assert_eq!(future.wait(), JobStatus::Errornous);
    assert!(matches!(
        future.errors()[0].error,
        AssayError::Configuration(ConfigurationError::UnknownColumn(_))
    ));
    assert!(future.results().is_empty());
}

// =============================================================================
// Datastores and storage
// =============================================================================

#[test]
fn test_csv_datastore_end_to_end() {
    let file = create_test_file(
        "name,city\n\
         Ann,Oslo\n\
         Bob,NA\n\
         ,Rome\n\
         Dan,Oslo\n",
    );
    let datastore = Arc::new(CsvDatastore::new(file.path()));
    let mut builder = AnalysisJobBuilder::new(Arc::new(ComponentRegistry::with_builtins()));
    let columns = builder.set_datastore(datastore.as_ref()).unwrap();
    builder
        .add_component_with("Completeness", &columns, no_properties())
        .unwrap();
    builder
        .add_component_with("Value distribution", &columns[1..], no_properties())
        .unwrap();

    let future = AnalysisRunner::new(EngineConfig::default())
        .run(Arc::new(builder.to_analysis_job().unwrap()), datastore);
    assert!(future.is_successful());

    let completeness = future.result_for("Completeness").unwrap();
    assert_eq!(cell(&completeness, "name", "Null count"), Some(1));
    assert_eq!(cell(&completeness, "city", "Null count"), Some(1));
    assert_eq!(completeness.count("Incomplete row count"), Some(2));

    let cities = future.result_for("Value distribution").unwrap();
    assert_eq!(value_counts(&cities).get("Oslo"), Some(&2));
}

#[test]
fn test_spilled_storage_gives_same_results() {
    init_tracing();
    let rows: Vec<String> = (0..400).map(|i| format!("value-{}", i % 250)).collect();
    let refs: Vec<[&str; 1]> = rows.iter().map(|r| [r.as_str()]).collect();
    let slices: Vec<&[&str]> = refs.iter().map(|r| r.as_slice()).collect();
    let table = DataTable::from_strings(&["value"], &slices);
    let datastore = MemoryDatastore::new("values", table);

    let dir = TempDir::new().unwrap();
    let mut results = Vec::new();
    for backend in [StorageBackend::Memory, StorageBackend::Auto, StorageBackend::Sqlite] {
        let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);
        builder
            .add_component_with("Value distribution", &columns, no_properties())
            .unwrap();
        let mut config = EngineConfig::default()
            .with_concurrency(2)
            .with_storage_backend(backend)
            .with_spill_threshold(20);
        config.storage.directory = Some(dir.path().to_path_buf());

        let future = run(builder.to_analysis_job().unwrap(), datastore.clone(), config);
        assert!(future.is_successful(), "{:?} failed: {:?}", backend, future.errors());
        results.push(future.results().remove(0));
    }

    for result in &results {
        assert_eq!(result.count("Distinct count"), Some(250));
        assert_eq!(result.count("Unique count"), Some(100));
        assert_eq!(result.crosstab, results[0].crosstab);
    }
}

#[test]
fn test_non_finite_floats_survive_every_backend() {
    let readings = ["NaN", "1.5", "inf", "NaN", "-inf"];
    let rows: Vec<Vec<Value>> = readings
        .iter()
        .map(|r| vec![DataType::Float.parse(r)])
        .collect();
    let table = DataTable::new(vec![SourceColumn::new("reading", DataType::Float)], rows);
    let datastore = MemoryDatastore::new("readings", table);

    let dir = TempDir::new().unwrap();
    for backend in [StorageBackend::Memory, StorageBackend::Auto, StorageBackend::Sqlite] {
        let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);
        builder
            .add_component_with("Value distribution", &columns, no_properties())
            .unwrap();
        let mut config = EngineConfig::default()
            .with_concurrency(2)
            .with_storage_backend(backend)
            .with_spill_threshold(1);
        config.storage.directory = Some(dir.path().to_path_buf());

        let future = run(builder.to_analysis_job().unwrap(), datastore.clone(), config);
        assert!(future.is_successful(), "{:?} failed: {:?}", backend, future.errors());

        let counts = value_counts(&future.result_for("Value distribution").unwrap());
        assert_eq!(counts.get("NaN"), Some(&2), "{:?}", backend);
        assert_eq!(counts.get("inf"), Some(&1), "{:?}", backend);
        assert_eq!(counts.get("-inf"), Some(&1), "{:?}", backend);
        assert_eq!(counts.get("1.5"), Some(&1), "{:?}", backend);
    }
}

#[test]
fn test_storage_failure_halts_execution() {
    init_tracing();
    // A file where the overflow directory should be: the first spill fails.
    let not_a_directory = create_test_file("");
    let datastore = numbers(2_000);
    let (mut builder, columns) = builder_for(ComponentRegistry::with_builtins(), &datastore);
    builder
        .add_component_with("Value distribution", &columns[..1], no_properties())
        .unwrap();
    builder
        .add_component_with("Completeness", &columns[..1], no_properties())
        .unwrap();

    let mut config = EngineConfig::default()
        .with_concurrency(2)
        .with_max_in_flight_rows(8)
        .with_storage_backend(StorageBackend::Auto)
        .with_spill_threshold(20);
    config.storage.directory = Some(not_a_directory.path().to_path_buf());

    let future = run(builder.to_analysis_job().unwrap(), datastore, config);
    assert_eq!(future.wait_timeout(Duration::from_secs(30)), JobStatus::Errornous);

    let errors = future.errors();
    assert!(!errors.is_empty());
    assert!(errors.iter().all(|e| e.error.is_fatal()), "errors: {:?}", errors);
    assert_eq!(errors[0].component.as_deref(), Some("Value distribution"));

    let processed = future
        .result_for("Completeness")
        .unwrap()
        .count("Row count")
        .unwrap();
    assert!(processed < 500, "processed {} rows after the failure", processed);
}

// =============================================================================
// Partitioned execution
// =============================================================================

#[test]
fn test_partitioned_results_match_single_run() {
    init_tracing();
    let datastore = numbers(103);
    let job = Arc::new(fan_out_job(&datastore));

    let whole = AnalysisRunner::new(small_sample_config(2)).run(Arc::clone(&job), Arc::new(datastore.clone()));
    let partitioned = PartitionedAnalysisRunner::new(small_sample_config(4), 4)
        .run(Arc::clone(&job), Arc::new(datastore))
        .unwrap();

    assert!(whole.is_successful());
    assert!(partitioned.is_successful(), "errors: {:?}", partitioned.errors());

    let whole = whole.results_map();
    let parts = partitioned.results_map();
    assert_eq!(parts.len(), whole.len());

    let expected = &whole["Completeness"];
    let actual = &parts["Completeness"];
    assert_eq!(cell(actual, "number", "Valid count"), cell(expected, "number", "Valid count"));
    assert_eq!(actual.count("Row count"), Some(103));

    let expected = &whole["Value distribution"];
    let actual = &parts["Value distribution"];
    assert_eq!(value_counts(actual).len(), value_counts(expected).len());
    for (value, count) in value_counts(expected) {
        assert_eq!(value_counts(actual).get(&value), Some(&count), "count of {}", value);
    }
    assert_eq!(actual.count("Total count"), expected.count("Total count"));

    assert_eq!(
        collected_ids(&parts["Row collector"]),
        collected_ids(&whole["Row collector"])
    );
}

#[test]
fn test_partitioning_requires_reducers() {
    let mut registry = ComponentRegistry::with_builtins();
    registry.register(SlowFactory::new());
    let datastore = numbers(4);
    let (mut builder, columns) = builder_for(registry, &datastore);
    builder
        .add_component_with("Slow", &columns, no_properties())
        .unwrap();

    let err = PartitionedAnalysisRunner::new(EngineConfig::default(), 2)
        .run(Arc::new(builder.to_analysis_job().unwrap()), Arc::new(datastore))
        .unwrap_err();
    assert!(matches!(
        err,
        AssayError::Configuration(ConfigurationError::NotPartitionable(_))
    ));
}
