//! Executing analysis jobs.
//!
//! [`AnalysisRunner::run`] starts an execution on a coordinator thread and
//! returns an [`AnalysisResultFuture`] right away. The coordinator reads
//! source rows and schedules one task per (row, component) pair on a task
//! runner; see the `processor` module for how rows move through the graph.
//!
//! ```ignore
//! let runner = AnalysisRunner::new(EngineConfig::default());
//! let future = runner.run(Arc::new(job), Arc::new(datastore));
//! for result in future.results() {
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//! }
//! ```

mod cancel;
mod future;
mod listener;
mod partitioned;
mod processor;
mod router;
mod task;

pub use cancel::CancellationToken;
pub use future::{AnalysisError, AnalysisResultFuture, JobStatus};
pub use listener::{AnalysisListener, CompositeAnalysisListener, LoggingAnalysisListener};
pub use partitioned::PartitionedAnalysisRunner;
pub use router::RequirementRouter;
pub use task::{
    MultiThreadedTaskRunner, SingleThreadedTaskRunner, Task, TaskRunner, create_task_runner,
};

use std::sync::Arc;
use std::thread;

use tracing::error;

use crate::config::EngineConfig;
use crate::error::AssayError;
use crate::input::{Datastore, RowIdGenerator, RowRange};
use crate::job::AnalysisJob;
use future::FutureState;
use processor::ExecutionRequest;

/// Runs frozen jobs against datastores.
///
/// Events go to a [`LoggingAnalysisListener`] plus any listener added with
/// [`with_listener`](Self::with_listener).
#[derive(Clone)]
pub struct AnalysisRunner {
    config: EngineConfig,
    listeners: CompositeAnalysisListener,
}

impl AnalysisRunner {
    pub fn new(config: EngineConfig) -> Self {
        let mut listeners = CompositeAnalysisListener::new();
        listeners.add(Arc::new(LoggingAnalysisListener));
        Self { config, listeners }
    }

    pub fn with_listener(mut self, listener: Arc<dyn AnalysisListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start executing `job` over every row of `datastore`.
    pub fn run(&self, job: Arc<AnalysisJob>, datastore: Arc<dyn Datastore>) -> AnalysisResultFuture {
        self.run_range(
            job,
            datastore,
            RowRange::all(),
            Arc::new(RowIdGenerator::new()),
            CancellationToken::new(),
        )
    }

    pub(crate) fn run_range(
        &self,
        job: Arc<AnalysisJob>,
        datastore: Arc<dyn Datastore>,
        range: RowRange,
        ids: Arc<RowIdGenerator>,
        cancel: CancellationToken,
    ) -> AnalysisResultFuture {
        let state = FutureState::new();
        let future = AnalysisResultFuture::new(Arc::clone(&job), Arc::clone(&state), cancel.clone());

        let request = ExecutionRequest {
            job,
            datastore,
            config: self.config.clone(),
            range,
            ids,
            cancel,
            listener: Arc::new(self.listeners.clone()),
            state: Arc::clone(&state),
        };
        let spawned = thread::Builder::new()
            .name("assay-coordinator".to_string())
            .spawn(move || processor::execute(request));
        if let Err(e) = spawned {
            error!(error = %e, "failed to start coordinator thread");
            state.add_error(AnalysisError::new(
                None,
                None,
                AssayError::Execution(format!("failed to start coordinator: {}", e)),
            ));
            state.settle(JobStatus::Errornous);
        }
        future
    }
}
