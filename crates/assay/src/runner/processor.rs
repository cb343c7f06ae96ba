//! Row scheduling.
//!
//! Components are grouped into layers: consecutive components in execution
//! order that do not depend on each other. Every source row visits the
//! layers in order. Within a visit each eligible member runs as its own
//! task; the task that finishes last merges the layer's outputs into the
//! row and moves it on. A multi-row transformer always forms a layer of its
//! own, and every row it emits continues from the following layer.
//!
//! `remaining[l]` counts the rows that have yet to pass layer `l`, fan-out
//! included. Once the source is exhausted and a layer's count reaches zero
//! its components are closed, and the execution settles when the last
//! layer closes.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{Span, debug, info_span, warn};

use super::future::{AnalysisError, FutureState, JobStatus};
use super::listener::AnalysisListener;
use super::router::RequirementRouter;
use super::task::{TaskRunner, create_task_runner};
use super::CancellationToken;
use crate::config::{EngineConfig, ErrorPolicy};
use crate::descriptor::{Component, ComponentContext, ComponentKind, OutputRowCollector};
use crate::error::{AssayError, ConfigurationError, Result};
use crate::input::{Datastore, IdScope, InputRow, RowId, RowIdGenerator, RowRange};
use crate::job::{AnalysisJob, ComponentId, ComponentJob, FilterOutcomes};
use crate::schema::{InputColumn, Value};
use crate::storage::create_storage_provider;

/// A set of mutually independent components, by execution position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Layer {
    pub(crate) members: Vec<usize>,
    pub(crate) fan_out: bool,
}

/// Group the job's components greedily into layers.
pub(crate) fn plan_layers(job: &AnalysisJob) -> Vec<Layer> {
    let mut layers = Vec::new();
    let mut members: Vec<usize> = Vec::new();
    let mut member_ids: HashSet<ComponentId> = HashSet::new();

    for (position, component) in job.components().iter().enumerate() {
        let fan_out = component.kind() == ComponentKind::Transformer
            && component.descriptor().multi_row;
        let depends_on_layer = dependencies(component)
            .iter()
            .any(|d| member_ids.contains(d));

        if (fan_out || depends_on_layer) && !members.is_empty() {
            layers.push(Layer {
                members: std::mem::take(&mut members),
                fan_out: false,
            });
            member_ids.clear();
        }

        if fan_out {
            layers.push(Layer {
                members: vec![position],
                fan_out: true,
            });
        } else {
            members.push(position);
            member_ids.insert(component.id());
        }
    }
    if !members.is_empty() {
        layers.push(Layer {
            members,
            fan_out: false,
        });
    }
    layers
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

/// Everything one execution needs, handed to the coordinator thread.
pub(crate) struct ExecutionRequest {
    pub(crate) job: Arc<AnalysisJob>,
    pub(crate) datastore: Arc<dyn Datastore>,
    pub(crate) config: EngineConfig,
    pub(crate) range: RowRange,
    pub(crate) ids: Arc<RowIdGenerator>,
    pub(crate) cancel: CancellationToken,
    pub(crate) listener: Arc<dyn AnalysisListener>,
    pub(crate) state: Arc<FutureState>,
}

impl ExecutionRequest {
    fn fail(&self, component: Option<&ComponentJob>, error: AssayError) {
        match component {
            Some(component) => {
                self.listener
                    .error_in_component(&self.job, component, None, &error)
            }
            None => self.listener.error_unknown(&self.job, &error),
        }
        self.state.add_error(AnalysisError::new(
            component.map(|c| c.name().to_string()),
            None,
            error,
        ));
        self.state.settle(JobStatus::Errornous);
    }
}

/// Run one execution to completion on the calling thread.
///
/// The datastore connection is held until every row has been processed
/// and released afterwards, whether the execution succeeded or not.
pub(crate) fn execute(request: ExecutionRequest) {
    let span = info_span!("analysis", job = %request.job.name());
    let _entered = span.enter();

    request.listener.job_begin(&request.job);

    let mut connection = match request.datastore.open() {
        Ok(connection) => connection,
        Err(e) => return request.fail(None, e),
    };
    if let Some(expected) = request.job.datastore() {
        if expected != request.datastore.name() {
            warn!(
                expected,
                actual = request.datastore.name(),
                "job was built against a different datastore"
            );
        }
    }

    let mut column_map = Vec::with_capacity(request.job.source_columns().len());
    for column in request.job.source_columns() {
        let name = column.name();
        match connection.columns().iter().position(|c| c.name == name) {
            Some(index) => column_map.push((column.clone(), index)),
            None => return request.fail(None, ConfigurationError::UnknownColumn(name).into()),
        }
    }

    let consumers = match create_consumers(&request) {
        Some(consumers) => consumers,
        None => return,
    };

    let runner = match create_task_runner(&request.config) {
        Ok(runner) => runner,
        Err(e) => {
            close_all(&consumers);
            return request.fail(None, e);
        }
    };

    let layers = plan_layers(&request.job);
    debug!(
        layers = layers.len(),
        concurrency = request.config.concurrency,
        "execution planned"
    );

    let execution = Arc::new(Execution {
        router: RequirementRouter::new(&request.job),
        remaining: layers.iter().map(|_| AtomicUsize::new(0)).collect(),
        closed: layers.iter().map(|_| AtomicBool::new(false)).collect(),
        open_layers: AtomicUsize::new(layers.len()),
        layers,
        consumers,
        job: Arc::clone(&request.job),
        config: request.config.clone(),
        ids: Arc::clone(&request.ids),
        runner: Arc::clone(&runner),
        listener: Arc::clone(&request.listener),
        cancel: request.cancel.clone(),
        state: Arc::clone(&request.state),
        span: span.clone(),
        exhausted: AtomicBool::new(false),
        halted: AtomicBool::new(false),
        finished: AtomicBool::new(false),
        in_flight: Mutex::new(0),
        slot_freed: Condvar::new(),
        rows: AtomicU64::new(0),
    });

    match connection.read(request.range) {
        Ok(rows) => {
            let mut ordinal = request.range.offset as u64;
            for next in rows {
                if execution.is_stopping() || !execution.acquire_slot() {
                    break;
                }
                match next {
                    Ok(source) => {
                        let id = execution.ids.physical(ordinal);
                        ordinal += 1;
                        let values = column_map
                            .iter()
                            .map(|(column, index)| {
                                let value = source.values.get(*index).cloned().unwrap_or(Value::Null);
                                (column.clone(), value)
                            })
                            .collect();
                        execution.start_row(InputRow::new(id, values), source.distinct_count);
                    }
                    Err(e) => {
                        execution.release_slot();
                        execution.record_error(None, None, e);
                        execution.halted.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        Err(e) => {
            execution.record_error(None, None, e);
            execution.halted.store(true, Ordering::SeqCst);
        }
    }

    execution.source_exhausted();
    request.state.wait();
    runner.shutdown();
    debug!(rows = execution.rows.load(Ordering::Relaxed), "execution released");
}

fn create_consumers(request: &ExecutionRequest) -> Option<Vec<Consumer>> {
    let storage = match create_storage_provider(&request.config.storage) {
        Ok(storage) => storage,
        Err(e) => {
            request.fail(None, e);
            return None;
        }
    };
    let annotations = match storage.create_row_annotation_factory() {
        Ok(annotations) => annotations,
        Err(e) => {
            request.fail(None, e);
            return None;
        }
    };

    let mut consumers = Vec::with_capacity(request.job.components().len());
    for job_component in request.job.components() {
        let context = ComponentContext {
            component_name: job_component.name().to_string(),
            storage: Arc::clone(&storage),
            annotations: Arc::clone(&annotations),
        };
        let created = job_component
            .factory()
            .create(job_component.configuration())
            .and_then(|mut component| component.initialize(&context).map(|_| component));
        match created {
            Ok(component) => {
                request.listener.component_begin(&request.job, job_component);
                let serial = (!job_component.descriptor().concurrent).then(|| Mutex::new(()));
                consumers.push(Consumer { component, serial });
            }
            Err(e) => {
                close_all(&consumers);
                request.fail(Some(job_component), e);
                return None;
            }
        }
    }
    Some(consumers)
}

fn close_all(consumers: &[Consumer]) {
    for consumer in consumers {
        if let Err(e) = consumer.component.close() {
            warn!(error = %e, "failed to close component");
        }
    }
}

struct Consumer {
    component: Component,
    /// Held around every invocation of a non-concurrent component.
    serial: Option<Mutex<()>>,
}

/// The live frames of one source row: itself or the rows fanned out of it.
struct RowTicket {
    live: AtomicUsize,
    ids: IdScope,
}

struct RowState {
    row: InputRow,
    distinct_count: u32,
    outcomes: FilterOutcomes,
    ticket: Arc<RowTicket>,
}

/// One row passing through one layer.
struct Visit {
    state: RowState,
    layer: usize,
    pending: AtomicUsize,
    outputs: Mutex<Vec<(usize, MemberOutput)>>,
}

enum MemberOutput {
    Values(Vec<(InputColumn, Value)>),
    Category(String),
    Nothing,
}

struct Execution {
    job: Arc<AnalysisJob>,
    config: EngineConfig,
    layers: Vec<Layer>,
    consumers: Vec<Consumer>,
    router: RequirementRouter,
    ids: Arc<RowIdGenerator>,
    runner: Arc<dyn TaskRunner>,
    listener: Arc<dyn AnalysisListener>,
    cancel: CancellationToken,
    state: Arc<FutureState>,
    span: Span,
    remaining: Vec<AtomicUsize>,
    closed: Vec<AtomicBool>,
    open_layers: AtomicUsize,
    exhausted: AtomicBool,
    halted: AtomicBool,
    finished: AtomicBool,
    in_flight: Mutex<usize>,
    slot_freed: Condvar,
    rows: AtomicU64,
}

impl Execution {
    fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled() || self.halted.load(Ordering::SeqCst)
    }

    /// Wait for room under the in-flight bound. False if the execution is
    /// stopping.
    fn acquire_slot(&self) -> bool {
        let max = self.config.max_in_flight_rows.max(1);
        let mut in_flight = self.in_flight.lock();
        while *in_flight >= max {
            if self.is_stopping() {
                return false;
            }
            self.slot_freed
                .wait_for(&mut in_flight, Duration::from_millis(50));
        }
        *in_flight += 1;
        true
    }

    fn release_slot(&self) {
        let mut in_flight = self.in_flight.lock();
        *in_flight = in_flight.saturating_sub(1);
        self.slot_freed.notify_one();
    }

    fn start_row(self: &Arc<Self>, row: InputRow, distinct_count: u32) {
        for remaining in &self.remaining {
            remaining.fetch_add(1, Ordering::SeqCst);
        }
        let state = RowState {
            row,
            distinct_count,
            outcomes: FilterOutcomes::new(),
            ticket: Arc::new(RowTicket {
                live: AtomicUsize::new(1),
                ids: self.ids.scope(),
            }),
        };
        self.advance(state, 0);

        let rows = self.rows.fetch_add(1, Ordering::Relaxed) + 1;
        let interval = self.config.progress_interval;
        if interval > 0 && rows % interval == 0 {
            self.listener.row_processing_progress(&self.job, rows);
        }
    }

    fn submit(self: &Arc<Self>, task: impl FnOnce(&Arc<Self>) + Send + 'static) {
        let this = Arc::clone(self);
        let span = self.span.clone();
        self.runner.submit(Box::new(move || {
            let _entered = span.enter();
            task(&this);
        }));
    }

    /// Move a row forward from `layer`, skipping layers with nothing
    /// eligible, until tasks are scheduled or the row leaves the graph.
    fn advance(self: &Arc<Self>, state: RowState, mut layer: usize) {
        loop {
            if layer >= self.layers.len() {
                self.release_frame(&state.ticket);
                return;
            }
            if self.is_stopping() {
                self.abandon(&state.ticket, layer);
                return;
            }

            let eligible: Vec<usize> = self.layers[layer]
                .members
                .iter()
                .copied()
                .filter(|&p| self.router.is_eligible(p, &state.outcomes))
                .collect();
            if eligible.is_empty() {
                self.pass_layer(layer);
                layer += 1;
                continue;
            }

            if self.layers[layer].fan_out {
                let position = eligible[0];
                self.submit(move |this| this.fan_out(state, layer, position));
                return;
            }

            let visit = Arc::new(Visit {
                state,
                layer,
                pending: AtomicUsize::new(eligible.len()),
                outputs: Mutex::new(Vec::with_capacity(eligible.len())),
            });
            for position in eligible {
                let visit = Arc::clone(&visit);
                self.submit(move |this| this.consume(&visit, position));
            }
            return;
        }
    }

    fn consume(self: &Arc<Self>, visit: &Arc<Visit>, position: usize) {
        if !self.is_stopping() {
            let output = self.invoke(position, &visit.state);
            visit.outputs.lock().push((position, output));
        }
        if visit.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete_visit(visit);
        }
    }

    /// Merge a layer's outputs into the row and move on.
    fn complete_visit(self: &Arc<Self>, visit: &Visit) {
        let mut outputs = std::mem::take(&mut *visit.outputs.lock());
        outputs.sort_by_key(|(position, _)| *position);

        let mut outcomes = visit.state.outcomes.clone();
        let mut values = Vec::new();
        for (position, output) in outputs {
            match output {
                MemberOutput::Values(v) => values.extend(v),
                MemberOutput::Category(category) => {
                    outcomes.record(self.job.components()[position].id(), category);
                }
                MemberOutput::Nothing => {}
            }
        }

        let row = if values.is_empty() {
            visit.state.row.clone()
        } else {
            visit.state.row.extend(visit.state.row.id(), values)
        };
        let next = RowState {
            row,
            distinct_count: visit.state.distinct_count,
            outcomes,
            ticket: Arc::clone(&visit.state.ticket),
        };
        self.pass_layer(visit.layer);
        self.advance(next, visit.layer + 1);
    }

    fn invoke(&self, position: usize, state: &RowState) -> MemberOutput {
        let job_component = &self.job.components()[position];
        let consumer = &self.consumers[position];
        let _serial = consumer.serial.as_ref().map(|m| m.lock());

        let invoked = catch_panic(job_component.name(), || match &consumer.component {
            Component::Filter(filter) => {
                let category = filter.categorize(&state.row)?;
                if !job_component.descriptor().has_category(&category) {
                    return Err(AssayError::component(
                        job_component.name(),
                        format!("returned undeclared category '{}'", category),
                    ));
                }
                Ok(MemberOutput::Category(category))
            }
            Component::Transformer(transformer) => {
                let mut out = OutputRowCollector::new(job_component.outputs().len());
                transformer.transform(&state.row, &mut out)?;
                let mut rows = out.into_rows();
                match rows.len() {
                    0 => Ok(MemberOutput::Nothing),
                    1 => Ok(MemberOutput::Values(
                        job_component
                            .outputs()
                            .iter()
                            .cloned()
                            .zip(rows.remove(0))
                            .collect(),
                    )),
                    n => Err(AssayError::component(
                        job_component.name(),
                        format!("emitted {} rows but is not a multi-row transformer", n),
                    )),
                }
            }
            Component::Analyzer(analyzer) => analyzer
                .run(&state.row, state.distinct_count)
                .map(|_| MemberOutput::Nothing),
        });

        match invoked {
            Ok(output) => output,
            Err(e) => {
                self.record_error(Some(position), Some(state.row.id()), e);
                MemberOutput::Nothing
            }
        }
    }

    fn fan_out(self: &Arc<Self>, state: RowState, layer: usize, position: usize) {
        if self.is_stopping() {
            self.abandon(&state.ticket, layer);
            return;
        }

        let job_component = &self.job.components()[position];
        let consumer = &self.consumers[position];
        let emitted = {
            let _serial = consumer.serial.as_ref().map(|m| m.lock());
            catch_panic(job_component.name(), || match &consumer.component {
                Component::Transformer(transformer) => {
                    let mut out = OutputRowCollector::new(job_component.outputs().len());
                    transformer.transform(&state.row, &mut out)?;
                    Ok(out.into_rows())
                }
                _ => Err(AssayError::component(
                    job_component.name(),
                    "only transformers can emit rows",
                )),
            })
        };

        let rows = match emitted {
            Ok(rows) => rows,
            Err(e) => {
                // The row continues without the transformer's columns.
                self.record_error(Some(position), Some(state.row.id()), e);
                self.pass_layer(layer);
                self.advance(state, layer + 1);
                return;
            }
        };

        if rows.is_empty() {
            self.abandon(&state.ticket, layer);
            return;
        }

        let extra = rows.len() - 1;
        if extra > 0 {
            for remaining in &self.remaining[layer + 1..] {
                remaining.fetch_add(extra, Ordering::SeqCst);
            }
            state.ticket.live.fetch_add(extra, Ordering::SeqCst);
        }
        self.pass_layer(layer);

        let parent = state.row.id();
        for (ordinal, values) in rows.into_iter().enumerate() {
            let id = self.ids.derive(&state.ticket.ids, parent, position, ordinal);
            let row = state.row.extend(
                id,
                job_component.outputs().iter().cloned().zip(values).collect(),
            );
            let child = RowState {
                row,
                distinct_count: state.distinct_count,
                outcomes: state.outcomes.clone(),
                ticket: Arc::clone(&state.ticket),
            };
            self.advance(child, layer + 1);
        }
    }

    /// The frame stops at `layer`: it will not pass any layer from there on.
    fn abandon(&self, ticket: &RowTicket, layer: usize) {
        for l in layer..self.layers.len() {
            self.pass_layer(l);
        }
        self.release_frame(ticket);
    }

    fn release_frame(&self, ticket: &RowTicket) {
        if ticket.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.release_slot();
        }
    }

    fn pass_layer(&self, layer: usize) {
        if self.remaining[layer].fetch_sub(1, Ordering::SeqCst) == 1
            && self.exhausted.load(Ordering::SeqCst)
        {
            self.close_layer(layer);
        }
    }

    fn source_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
        debug!(rows = self.rows.load(Ordering::Relaxed), "source exhausted");
        if self.layers.is_empty() {
            self.finish();
            return;
        }
        for layer in 0..self.layers.len() {
            if self.remaining[layer].load(Ordering::SeqCst) == 0 {
                self.close_layer(layer);
            }
        }
    }

    fn close_layer(&self, layer: usize) {
        if self.closed[layer].swap(true, Ordering::SeqCst) {
            return;
        }
        let cancelled = self.cancel.is_cancelled();

        for &position in &self.layers[layer].members {
            let job_component = &self.job.components()[position];
            let component = &self.consumers[position].component;

            let mut result = None;
            if let Component::Analyzer(analyzer) = component {
                if !cancelled {
                    match catch_panic(job_component.name(), || analyzer.result()) {
                        Ok(r) => result = Some(r),
                        Err(e) => self.record_error(Some(position), None, e),
                    }
                }
            }
            if let Err(e) = catch_panic(job_component.name(), || component.close()) {
                self.record_error(Some(position), None, e);
            }

            self.listener
                .component_success(&self.job, job_component, result.as_ref());
            if let Some(result) = result {
                self.state.add_result(job_component.id(), result);
            }
        }

        if self.open_layers.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let rows = self.rows.load(Ordering::Relaxed);
        let status = if self.cancel.is_cancelled() {
            self.listener.job_cancelled(&self.job);
            JobStatus::Cancelled
        } else {
            self.listener.job_success(&self.job, rows);
            if self.state.has_errors() {
                JobStatus::Errornous
            } else {
                JobStatus::Successful
            }
        };
        debug!(rows, %status, "execution settled");
        self.state.settle(status);
    }

    fn record_error(&self, position: Option<usize>, row_id: Option<RowId>, error: AssayError) {
        let component = position.map(|p| &self.job.components()[p]);
        match component {
            Some(component) => self
                .listener
                .error_in_component(&self.job, component, row_id, &error),
            None => self.listener.error_unknown(&self.job, &error),
        }
        if error.is_fatal() || self.config.error_policy == ErrorPolicy::AbortOnFirstError {
            self.halted.store(true, Ordering::SeqCst);
        }
        self.state.add_error(AnalysisError::new(
            component.map(|c| c.name().to_string()),
            row_id,
            error,
        ));
    }
}

/// Run component code, turning a panic into a component error.
fn catch_panic<T>(component: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(AssayError::component(component, format!("panicked: {}", message)))
        }
    }
}
