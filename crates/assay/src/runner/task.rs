//! Task runners: where scheduled units of work actually execute.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::config::EngineConfig;
use crate::error::{AssayError, Result};

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks handed over by the scheduler.
///
/// Tasks may submit further tasks. A runner never runs a submitted task
/// on the submitter's stack while another task is executing there, so deep
/// chains of follow-up work do not grow the stack.
pub trait TaskRunner: Send + Sync {
    fn submit(&self, task: Task);

    /// Stop accepting work and release worker threads.
    fn shutdown(&self) {}
}

/// Select the runner matching the configured concurrency.
pub fn create_task_runner(config: &EngineConfig) -> Result<Arc<dyn TaskRunner>> {
    if config.is_single_threaded() {
        Ok(Arc::new(SingleThreadedTaskRunner::new()))
    } else {
        Ok(Arc::new(MultiThreadedTaskRunner::new(config.concurrency)?))
    }
}

fn run_task(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        error!("scheduled task panicked");
    }
}

/// Runs every task on the submitting thread.
///
/// The first submission drains the queue; submissions made by running
/// tasks are queued and picked up by the same loop.
#[derive(Default)]
pub struct SingleThreadedTaskRunner {
    queue: Mutex<VecDeque<Task>>,
    draining: AtomicBool,
}

impl SingleThreadedTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRunner for SingleThreadedTaskRunner {
    fn submit(&self, task: Task) {
        self.queue.lock().push_back(task);
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => run_task(task),
                None => break,
            }
        }
        self.draining.store(false, Ordering::Release);
    }
}

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// A fixed pool of worker threads fed from one queue.
pub struct MultiThreadedTaskRunner {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiThreadedTaskRunner {
    pub fn new(threads: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("assay-worker-{}", i))
                .spawn(move || work(&shared))
                .map_err(|e| AssayError::Execution(format!("failed to spawn worker: {}", e)))?;
            workers.push(handle);
        }
        debug!(threads = workers.len(), "worker pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }
}

fn work(shared: &Shared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        match task {
            Some(task) => run_task(task),
            None => return,
        }
    }
}

impl TaskRunner for MultiThreadedTaskRunner {
    fn submit(&self, task: Task) {
        self.shared.queue.lock().push_back(task);
        self.shared.available.notify_one();
    }

    fn shutdown(&self) {
        {
            let _queue = self.shared.queue.lock();
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.available.notify_all();

        let current = thread::current().id();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            // A worker dropping the last handle to the pool cannot join itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for MultiThreadedTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
