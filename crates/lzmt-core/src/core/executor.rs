use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::work_stealing::{WorkStealingQueue, WorkStealingWorker};
use crate::sync::lock_unpoisoned;
use crate::telemetry::tags;
use crate::telemetry::worker::{DefaultWorkerTelemetry, WorkerTelemetry};
use crate::{Lzma2Error, Result};

/// A unit of work run on one executor thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

const IDLE_WAIT: Duration = Duration::from_millis(10);

/// Fixed set of worker threads fed by a work-stealing queue.
///
/// The executor knows nothing about compression: it runs opaque jobs and
/// reports their timing through [`WorkerTelemetry`]. One executor is shared by
/// every stream a coordinator opens.
pub struct TaskExecutor {
    state: Arc<ExecutorState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct ExecutorState {
    queue: Arc<WorkStealingQueue<Job>>,
    telemetry: Arc<dyn WorkerTelemetry>,
    started_at: Instant,
    accepting: AtomicBool,
    submitted: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
    task_counts: Vec<AtomicUsize>,
    worker_started_offsets_us: Vec<AtomicU64>,
    worker_stopped_offsets_us: Vec<AtomicU64>,
    worker_busy_us: Vec<AtomicU64>,
}

impl ExecutorState {
    fn new(num_workers: usize, telemetry: Arc<dyn WorkerTelemetry>) -> Self {
        let counters = |_| AtomicU64::new(0);
        Self {
            queue: Arc::new(WorkStealingQueue::new(num_workers)),
            telemetry,
            started_at: Instant::now(),
            accepting: AtomicBool::new(true),
            submitted: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            panicked: AtomicUsize::new(0),
            task_counts: (0..num_workers).map(|_| AtomicUsize::new(0)).collect(),
            worker_started_offsets_us: (0..num_workers).map(counters).collect(),
            worker_stopped_offsets_us: (0..num_workers).map(counters).collect(),
            worker_busy_us: (0..num_workers).map(counters).collect(),
        }
    }

    /// Offset from executor start, stored plus one so zero means "never".
    fn mark_offset(&self, slot: &AtomicU64) {
        let offset_us = self.started_at.elapsed().as_micros().min(u64::MAX as u128) as u64;
        slot.store(offset_us.saturating_add(1), Ordering::Release);
    }
}

/// Per-worker runtime metrics.
#[derive(Debug, Clone)]
pub struct WorkerRuntimeSnapshot {
    pub worker_id: usize,
    pub tasks_completed: usize,
    pub uptime: Duration,
    pub busy: Duration,
    pub idle: Duration,
    pub utilization: f64,
}

/// Runtime metrics for the executor and each of its workers.
#[derive(Debug, Clone)]
pub struct ExecutorRuntimeSnapshot {
    pub elapsed: Duration,
    pub submitted: usize,
    pub completed: usize,
    pub pending: usize,
    pub panicked: usize,
    pub workers: Vec<WorkerRuntimeSnapshot>,
}

impl TaskExecutor {
    /// Spawns `num_workers` threads (at least one) with default telemetry.
    pub fn new(num_workers: usize) -> Result<Self> {
        Self::with_telemetry(num_workers, Arc::new(DefaultWorkerTelemetry))
    }

    pub fn with_telemetry(num_workers: usize, telemetry: Arc<dyn WorkerTelemetry>) -> Result<Self> {
        let workers = num_workers.max(1);
        let state = Arc::new(ExecutorState::new(workers, telemetry));
        let executor = Self {
            state: Arc::clone(&state),
            handles: Mutex::new(Vec::with_capacity(workers)),
        };

        for worker_id in 0..workers {
            let worker = state
                .queue
                .worker(worker_id)
                .ok_or(Lzma2Error::IllegalState("executor worker already taken"))?;
            let worker_state = Arc::clone(&state);
            let handle = thread::Builder::new()
                .name(format!("lzmt-worker-{worker_id}"))
                .spawn(move || run_worker_loop(worker, worker_state))
                .map_err(|err| Lzma2Error::from(err).with_context("spawning executor thread"))?;
            lock_unpoisoned(&executor.handles).push(handle);
        }

        tracing::debug!(target: tags::LOG_PARALLEL, workers, "executor started");
        Ok(executor)
    }

    pub fn num_workers(&self) -> usize {
        self.state.task_counts.len()
    }

    /// Queues `job` for execution on some worker thread.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.state.accepting.load(Ordering::Acquire) {
            return Err(Lzma2Error::IllegalState("executor is shut down"));
        }
        self.state.submitted.fetch_add(1, Ordering::AcqRel);
        self.state.queue.submit(Box::new(job));
        Ok(())
    }

    pub fn submitted_count(&self) -> usize {
        self.state.submitted.load(Ordering::Acquire)
    }

    pub fn completed_count(&self) -> usize {
        self.state.completed.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.submitted_count().saturating_sub(self.completed_count())
    }

    pub fn runtime_snapshot(&self) -> ExecutorRuntimeSnapshot {
        let state = &self.state;
        let elapsed = state.started_at.elapsed();
        let elapsed_us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let submitted = self.submitted_count();
        let completed = self.completed_count();

        let workers = (0..state.task_counts.len())
            .map(|worker_id| {
                let started_raw = state.worker_started_offsets_us[worker_id].load(Ordering::Acquire);
                let stopped_raw = state.worker_stopped_offsets_us[worker_id].load(Ordering::Acquire);
                let stop_us = if stopped_raw == 0 {
                    elapsed_us
                } else {
                    stopped_raw - 1
                };
                let uptime_us = if started_raw == 0 {
                    0
                } else {
                    stop_us.saturating_sub(started_raw - 1)
                };
                let busy_us = state.worker_busy_us[worker_id]
                    .load(Ordering::Acquire)
                    .min(uptime_us);
                let utilization = if uptime_us == 0 {
                    0.0
                } else {
                    busy_us as f64 / uptime_us as f64
                };

                WorkerRuntimeSnapshot {
                    worker_id,
                    tasks_completed: state.task_counts[worker_id].load(Ordering::Acquire),
                    uptime: Duration::from_micros(uptime_us),
                    busy: Duration::from_micros(busy_us),
                    idle: Duration::from_micros(uptime_us - busy_us),
                    utilization,
                }
            })
            .collect();

        ExecutorRuntimeSnapshot {
            elapsed,
            submitted,
            completed,
            pending: submitted.saturating_sub(completed),
            panicked: state.panicked.load(Ordering::Acquire),
            workers,
        }
    }

    /// Stops accepting jobs, runs everything already queued, and joins the
    /// worker threads. Later calls return immediately.
    pub fn shutdown(&self) -> Result<()> {
        self.state.accepting.store(false, Ordering::Release);
        self.state.queue.close();

        let handles: Vec<_> = lock_unpoisoned(&self.handles).drain(..).collect();
        let mut first_error = None;
        let current = thread::current().id();
        for handle in handles {
            // The last owner can be one of our own jobs; that thread exits on
            // its own once the queue drains.
            if handle.thread().id() == current {
                continue;
            }
            if let Err(payload) = handle.join() {
                first_error.get_or_insert_with(|| {
                    Lzma2Error::Worker(format!(
                        "executor thread panicked: {}",
                        panic_message(payload.as_ref())
                    ))
                });
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(target: tags::LOG_PARALLEL, error = %err, "executor shutdown failed");
        }
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("workers", &self.num_workers())
            .field("submitted", &self.submitted_count())
            .field("completed", &self.completed_count())
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_worker_loop(worker: WorkStealingWorker<Job>, state: Arc<ExecutorState>) {
    let worker_id = worker.id();
    state.mark_offset(&state.worker_started_offsets_us[worker_id]);

    loop {
        let Some(job) = worker.steal() else {
            state.telemetry.on_queue_depth(worker_id, worker.queue_depth());
            if worker.is_drained() {
                break;
            }
            worker.wait_for_work(IDLE_WAIT);
            continue;
        };

        state.telemetry.on_queue_depth(worker_id, worker.queue_depth());
        state.telemetry.on_task_started(worker_id);
        let started_at = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(job));
        let elapsed = started_at.elapsed();

        state.worker_busy_us[worker_id].fetch_add(
            elapsed.as_micros().min(u64::MAX as u128) as u64,
            Ordering::AcqRel,
        );
        match outcome {
            Ok(()) => state.telemetry.on_task_finished(worker_id, elapsed),
            Err(payload) => {
                state.panicked.fetch_add(1, Ordering::AcqRel);
                state.telemetry.on_task_failed(worker_id, elapsed);
                tracing::warn!(
                    target: tags::LOG_PARALLEL,
                    worker_id,
                    panic = %panic_message(payload.as_ref()),
                    "executor job panicked"
                );
            }
        }
        state.completed.fetch_add(1, Ordering::AcqRel);
        state.task_counts[worker_id].fetch_add(1, Ordering::AcqRel);
    }

    state.mark_offset(&state.worker_stopped_offsets_us[worker_id]);
    tracing::trace!(target: tags::LOG_PARALLEL, worker_id, "executor worker stopped");
}
