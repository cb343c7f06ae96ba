//! Execution lifecycle notifications.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::AssayError;
use crate::input::RowId;
use crate::job::{AnalysisJob, ComponentJob};
use crate::result::AnalyzerResult;

/// Observer of one execution. Every method has an empty default.
///
/// Calls may arrive from worker threads.
pub trait AnalysisListener: Send + Sync {
    fn job_begin(&self, _job: &AnalysisJob) {}

    fn job_success(&self, _job: &AnalysisJob, _rows: u64) {}

    fn job_cancelled(&self, _job: &AnalysisJob) {}

    /// Called every `progress_interval` source rows.
    fn row_processing_progress(&self, _job: &AnalysisJob, _rows: u64) {}

    fn component_begin(&self, _job: &AnalysisJob, _component: &ComponentJob) {}

    /// The component was closed. Analyzers pass their result.
    fn component_success(
        &self,
        _job: &AnalysisJob,
        _component: &ComponentJob,
        _result: Option<&AnalyzerResult>,
    ) {
    }

    fn error_in_component(
        &self,
        _job: &AnalysisJob,
        _component: &ComponentJob,
        _row_id: Option<RowId>,
        _error: &AssayError,
    ) {
    }

    /// An error not attributable to one component.
    fn error_unknown(&self, _job: &AnalysisJob, _error: &AssayError) {}
}

/// Forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAnalysisListener;

impl AnalysisListener for LoggingAnalysisListener {
    fn job_begin(&self, job: &AnalysisJob) {
        info!(
            job = job.name(),
            components = job.components().len(),
            "analysis started"
        );
    }

    fn job_success(&self, job: &AnalysisJob, rows: u64) {
        info!(job = job.name(), rows, "analysis finished");
    }

    fn job_cancelled(&self, job: &AnalysisJob) {
        warn!(job = job.name(), "analysis cancelled");
    }

    fn row_processing_progress(&self, job: &AnalysisJob, rows: u64) {
        info!(job = job.name(), rows, "rows processed");
    }

    fn component_begin(&self, job: &AnalysisJob, component: &ComponentJob) {
        debug!(job = job.name(), component = component.name(), "component initialized");
    }

    fn component_success(
        &self,
        job: &AnalysisJob,
        component: &ComponentJob,
        result: Option<&AnalyzerResult>,
    ) {
        debug!(
            job = job.name(),
            component = component.name(),
            has_result = result.is_some(),
            "component closed"
        );
    }

    fn error_in_component(
        &self,
        job: &AnalysisJob,
        component: &ComponentJob,
        row_id: Option<RowId>,
        err: &AssayError,
    ) {
        match row_id {
            Some(row_id) => warn!(
                job = job.name(),
                component = component.name(),
                %row_id,
                error = %err,
                "component failed on row"
            ),
            None => error!(
                job = job.name(),
                component = component.name(),
                error = %err,
                "component failed"
            ),
        }
    }

    fn error_unknown(&self, job: &AnalysisJob, err: &AssayError) {
        error!(job = job.name(), error = %err, "analysis failed");
    }
}

/// Fans events out to several listeners, in registration order.
#[derive(Default, Clone)]
pub struct CompositeAnalysisListener {
    listeners: Vec<Arc<dyn AnalysisListener>>,
}

impl CompositeAnalysisListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn AnalysisListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl AnalysisListener for CompositeAnalysisListener {
    fn job_begin(&self, job: &AnalysisJob) {
        self.listeners.iter().for_each(|l| l.job_begin(job));
    }

    fn job_success(&self, job: &AnalysisJob, rows: u64) {
        self.listeners.iter().for_each(|l| l.job_success(job, rows));
    }

    fn job_cancelled(&self, job: &AnalysisJob) {
        self.listeners.iter().for_each(|l| l.job_cancelled(job));
    }

    fn row_processing_progress(&self, job: &AnalysisJob, rows: u64) {
        self.listeners
            .iter()
            .for_each(|l| l.row_processing_progress(job, rows));
    }

    fn component_begin(&self, job: &AnalysisJob, component: &ComponentJob) {
        self.listeners
            .iter()
            .for_each(|l| l.component_begin(job, component));
    }

    fn component_success(
        &self,
        job: &AnalysisJob,
        component: &ComponentJob,
        result: Option<&AnalyzerResult>,
    ) {
        self.listeners
            .iter()
            .for_each(|l| l.component_success(job, component, result));
    }

    fn error_in_component(
        &self,
        job: &AnalysisJob,
        component: &ComponentJob,
        row_id: Option<RowId>,
        err: &AssayError,
    ) {
        self.listeners
            .iter()
            .for_each(|l| l.error_in_component(job, component, row_id, err));
    }

    fn error_unknown(&self, job: &AnalysisJob, err: &AssayError) {
        self.listeners.iter().for_each(|l| l.error_unknown(job, err));
    }
}
