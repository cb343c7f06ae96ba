//! The handle returned to callers of a running analysis.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use super::CancellationToken;
use crate::error::AssayError;
use crate::input::RowId;
use crate::job::{AnalysisJob, ComponentId};
use crate::result::AnalyzerResult;

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Running,
    /// Finished without any error.
    Successful,
    /// Finished, but at least one error was recorded.
    Errornous,
    Cancelled,
}

impl JobStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Errornous => "errornous",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// An error captured during execution, with the component and row it
/// happened on when known.
#[derive(Debug)]
pub struct AnalysisError {
    pub component: Option<String>,
    pub row_id: Option<RowId>,
    pub error: AssayError,
}

impl AnalysisError {
    pub fn new(component: Option<String>, row_id: Option<RowId>, error: AssayError) -> Self {
        Self {
            component,
            row_id,
            error,
        }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.component, self.row_id) {
            (Some(component), Some(row_id)) => {
                write!(f, "[{} @ row {}] {}", component, row_id, self.error)
            }
            (Some(component), None) => write!(f, "[{}] {}", component, self.error),
            (None, Some(row_id)) => write!(f, "[row {}] {}", row_id, self.error),
            (None, None) => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

struct Outcome {
    status: JobStatus,
    results: IndexMap<ComponentId, AnalyzerResult>,
    errors: Vec<Arc<AnalysisError>>,
}

/// State shared between an execution and its future.
pub(crate) struct FutureState {
    outcome: Mutex<Outcome>,
    settled: Condvar,
}

impl FutureState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(Outcome {
                status: JobStatus::Running,
                results: IndexMap::new(),
                errors: Vec::new(),
            }),
            settled: Condvar::new(),
        })
    }

    pub(crate) fn add_error(&self, error: AnalysisError) {
        self.outcome.lock().errors.push(Arc::new(error));
    }

    pub(crate) fn add_shared_error(&self, error: Arc<AnalysisError>) {
        self.outcome.lock().errors.push(error);
    }

    pub(crate) fn add_result(&self, component: ComponentId, result: AnalyzerResult) {
        self.outcome.lock().results.insert(component, result);
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.outcome.lock().errors.is_empty()
    }

    pub(crate) fn wait(&self) -> JobStatus {
        let mut outcome = self.outcome.lock();
        while !outcome.status.is_done() {
            self.settled.wait(&mut outcome);
        }
        outcome.status
    }

    /// Move to a terminal status. Only the first call has an effect.
    pub(crate) fn settle(&self, status: JobStatus) {
        let mut outcome = self.outcome.lock();
        if outcome.status.is_done() {
            return;
        }
        outcome.status = status;
        self.settled.notify_all();
    }
}

/// Asynchronous handle on one execution.
///
/// Accessors for results block until the execution settles. Status and
/// error accessors never block, so errors can be inspected mid-flight.
#[derive(Clone)]
pub struct AnalysisResultFuture {
    job: Arc<AnalysisJob>,
    state: Arc<FutureState>,
    cancel: CancellationToken,
}

impl AnalysisResultFuture {
    pub(crate) fn new(job: Arc<AnalysisJob>, state: Arc<FutureState>, cancel: CancellationToken) -> Self {
        Self { job, state, cancel }
    }

    pub fn job(&self) -> &AnalysisJob {
        &self.job
    }

    pub fn status(&self) -> JobStatus {
        self.state.outcome.lock().status
    }

    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    /// Block until the execution settles.
    pub fn wait(&self) -> JobStatus {
        self.state.wait()
    }

    /// Block for at most `timeout`. Returns `Running` if it did not settle.
    pub fn wait_timeout(&self, timeout: Duration) -> JobStatus {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.state.outcome.lock();
        while !outcome.status.is_done() {
            if self.state.settled.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.status
    }

    pub fn is_successful(&self) -> bool {
        self.wait() == JobStatus::Successful
    }

    pub fn is_errornous(&self) -> bool {
        self.wait() == JobStatus::Errornous
    }

    pub fn is_cancelled(&self) -> bool {
        self.status() == JobStatus::Cancelled
    }

    /// Request cancellation. The future settles as `Cancelled` once the
    /// invocations already running have returned.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Analyzer results in job order. Analyzers that produced no result are
    /// skipped.
    pub fn results(&self) -> Vec<AnalyzerResult> {
        self.wait();
        let outcome = self.state.outcome.lock();
        self.job
            .analyzers()
            .filter_map(|a| outcome.results.get(&a.id()).cloned())
            .collect()
    }

    /// Results keyed by component name, in job order.
    pub fn results_map(&self) -> IndexMap<String, AnalyzerResult> {
        self.wait();
        let outcome = self.state.outcome.lock();
        self.job
            .analyzers()
            .filter_map(|a| {
                outcome
                    .results
                    .get(&a.id())
                    .map(|r| (a.name().to_string(), r.clone()))
            })
            .collect()
    }

    pub fn result_for(&self, component: &str) -> Option<AnalyzerResult> {
        let id = self.job.component_by_name(component)?.id();
        self.result_for_id(id)
    }

    pub fn result_for_id(&self, component: ComponentId) -> Option<AnalyzerResult> {
        self.wait();
        self.state.outcome.lock().results.get(&component).cloned()
    }

    /// Errors recorded so far.
    pub fn errors(&self) -> Vec<Arc<AnalysisError>> {
        self.state.outcome.lock().errors.clone()
    }
}

impl fmt::Debug for AnalysisResultFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisResultFuture")
            .field("job", &self.job.name())
            .field("status", &self.status())
            .finish()
    }
}
