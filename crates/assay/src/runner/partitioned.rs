//! Partitioned execution: split the source into row ranges, run each range
//! as its own execution and reduce the partial results.

use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info};

use super::future::{AnalysisError, FutureState, JobStatus};
use super::{AnalysisListener, AnalysisResultFuture, AnalysisRunner, CancellationToken};
use crate::config::EngineConfig;
use crate::error::{AssayError, ConfigurationError, Result};
use crate::input::{Datastore, RowIdGenerator, RowRange};
use crate::job::AnalysisJob;

/// Runs a job as several independent partitions and merges their results
/// with each analyzer's reducer.
///
/// Physical ids are numbered across the whole source and fan-out ids embed
/// their source row, so ids stay unique across partitions. Listeners see
/// every partition as an execution of its own.
pub struct PartitionedAnalysisRunner {
    config: EngineConfig,
    partitions: usize,
    runner: AnalysisRunner,
}

impl PartitionedAnalysisRunner {
    pub fn new(config: EngineConfig, partitions: usize) -> Self {
        let partitions = partitions.max(1);
        let per_partition = config
            .clone()
            .with_concurrency(config.concurrency / partitions);
        Self {
            config,
            partitions,
            runner: AnalysisRunner::new(per_partition),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn AnalysisListener>) -> Self {
        self.runner = self.runner.with_listener(listener);
        self
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the partitions. Fails right away if an analyzer of the job has
    /// no reducer.
    pub fn run(
        &self,
        job: Arc<AnalysisJob>,
        datastore: Arc<dyn Datastore>,
    ) -> Result<AnalysisResultFuture> {
        job.check_partitionable()?;

        let state = FutureState::new();
        let cancel = CancellationToken::new();
        let future = AnalysisResultFuture::new(Arc::clone(&job), Arc::clone(&state), cancel.clone());

        let runner = self.runner.clone();
        let partitions = self.partitions;
        let shared = Arc::clone(&state);
        thread::Builder::new()
            .name("assay-partitions".to_string())
            .spawn(move || coordinate(runner, partitions, job, datastore, cancel, shared))
            .map_err(|e| AssayError::Execution(format!("failed to start partitions: {}", e)))?;
        Ok(future)
    }
}

/// Split `rows` into at most `partitions` contiguous ranges.
pub(crate) fn partition_ranges(rows: usize, partitions: usize) -> Vec<RowRange> {
    if rows == 0 {
        return vec![RowRange::new(0, 0)];
    }
    let chunk = rows.div_ceil(partitions.max(1));
    (0..rows)
        .step_by(chunk)
        .map(|offset| RowRange::new(offset, chunk.min(rows - offset)))
        .collect()
}

fn coordinate(
    runner: AnalysisRunner,
    partitions: usize,
    job: Arc<AnalysisJob>,
    datastore: Arc<dyn Datastore>,
    cancel: CancellationToken,
    state: Arc<FutureState>,
) {
    let rows = match datastore.open().and_then(|mut c| c.row_count()) {
        Ok(rows) => rows,
        Err(e) => {
            error!(job = job.name(), error = %e, "could not count source rows");
            state.add_error(AnalysisError::new(None, None, e));
            state.settle(JobStatus::Errornous);
            return;
        }
    };

    let ranges = partition_ranges(rows, partitions);
    info!(job = job.name(), rows, partitions = ranges.len(), "partitioned analysis started");

    let ids = Arc::new(RowIdGenerator::new());
    let futures: Vec<AnalysisResultFuture> = ranges
        .into_iter()
        .map(|range| {
            runner.run_range(
                Arc::clone(&job),
                Arc::clone(&datastore),
                range,
                Arc::clone(&ids),
                cancel.clone(),
            )
        })
        .collect();

    let statuses: Vec<JobStatus> = futures.iter().map(|f| f.wait()).collect();
    for future in &futures {
        for err in future.errors() {
            state.add_shared_error(err);
        }
    }

    if cancel.is_cancelled() || statuses.contains(&JobStatus::Cancelled) {
        state.settle(JobStatus::Cancelled);
        return;
    }

    for analyzer in job.analyzers() {
        let partials: Vec<_> = futures
            .iter()
            .filter_map(|f| f.result_for_id(analyzer.id()))
            .collect();
        if partials.is_empty() {
            continue;
        }
        let reduced = analyzer
            .factory()
            .reducer()
            .ok_or_else(|| {
                AssayError::from(ConfigurationError::NotPartitionable(
                    analyzer.name().to_string(),
                ))
            })
            .and_then(|reducer| reducer.reduce(&partials));
        match reduced {
            Ok(result) => {
                debug!(component = analyzer.name(), partials = partials.len(), "results reduced");
                state.add_result(analyzer.id(), result);
            }
            Err(e) => state.add_error(AnalysisError::new(
                Some(analyzer.name().to_string()),
                None,
                e,
            )),
        }
    }

    let status = if state.has_errors() {
        JobStatus::Errornous
    } else {
        JobStatus::Successful
    };
    info!(job = job.name(), %status, "partitioned analysis finished");
    state.settle(status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_ranges_cover_rows() {
        let ranges = partition_ranges(10, 3);
        assert_eq!(
            ranges,
            vec![RowRange::new(0, 4), RowRange::new(4, 4), RowRange::new(8, 2)]
        );
    }

    #[test]
    fn test_partition_ranges_small_sources() {
        assert_eq!(partition_ranges(0, 4), vec![RowRange::new(0, 0)]);
        assert_eq!(partition_ranges(2, 4).len(), 2);
        assert_eq!(partition_ranges(5, 1), vec![RowRange::new(0, 5)]);
    }
}
