//! Assay: a concurrent data quality analysis engine.
//!
//! Jobs are graphs of pluggable components applied row by row to a tabular
//! source. Filters categorize rows and gate downstream components through
//! requirements, transformers derive new columns (and may emit several rows
//! per input row), and analyzers aggregate everything they see into
//! crosstab-shaped results.
//!
//! # Core Principles
//!
//! - **Explicit wiring**: components are described by typed descriptors and
//!   registered in a registry passed around explicitly
//! - **Frozen jobs**: a job is validated once and is immutable while it runs
//! - **Bounded memory**: buffered rows and values go through overflow storage
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use assay::{AnalysisJobBuilder, AnalysisRunner, ComponentRegistry, CsvDatastore, EngineConfig};
//!
//! let datastore = Arc::new(CsvDatastore::new("customers.csv"));
//! let mut builder = AnalysisJobBuilder::new(Arc::new(ComponentRegistry::with_builtins()));
//! let columns = builder.set_datastore(datastore.as_ref()).unwrap();
//! builder
//!     .add_component_with("Completeness", &columns, Vec::<(&str, _)>::new())
//!     .unwrap();
//!
//! let job = Arc::new(builder.to_analysis_job().unwrap());
//! let future = AnalysisRunner::new(EngineConfig::default()).run(job, datastore);
//! for result in future.results() {
//!     println!("{}", serde_json::to_string_pretty(&result).unwrap());
//! }
//! ```

pub mod components;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod input;
pub mod job;
pub mod result;
pub mod runner;
pub mod schema;
pub mod storage;

pub use config::{EngineConfig, ErrorPolicy, StorageBackend, StorageConfig};
pub use descriptor::{
    Analyzer, Component, ComponentContext, ComponentDescriptor, ComponentFactory, ComponentKind,
    ComponentRegistry, Filter, OutputRowCollector, Transformer,
};
pub use error::{AssayError, ConfigurationError, Result};
pub use input::{CsvDatastore, DataTable, Datastore, InputRow, MemoryDatastore, RowId};
pub use job::{AnalysisJob, AnalysisJobBuilder, ComponentId, ComponentRequirement, FilterOutcome};
pub use result::{AnalyzerResult, Crosstab, ResultReducer};
pub use runner::{
    AnalysisListener, AnalysisResultFuture, AnalysisRunner, JobStatus, PartitionedAnalysisRunner,
};
pub use schema::{DataType, InputColumn, Value};
