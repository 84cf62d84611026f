//! Block-parallel LZMA2 compression.
//!
//! A [`Lzma2Parallel`] coordinator owns the worker threads, the buffer pool
//! and a bounded set of block tasks. Each stream it opens is a
//! [`ParallelWriter`] that cuts its input into blocks, hands every block to a
//! task on the executor, and writes finished blocks back in order.

pub mod reorder;
pub(crate) mod task;
pub mod writer;

pub use reorder::ReorderRing;
pub use writer::{AbortHandle, ParallelWriter, StreamState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::buffer::BufferPool;
use crate::core::TaskExecutor;
use crate::options::Lzma2Options;
use crate::sink::Lzma2Sink;
use crate::sync::{lock_unpoisoned, wait_timeout_unpoisoned};
use crate::telemetry;
use crate::telemetry::tags;
use crate::telemetry::worker::{BlockTelemetry, DefaultBlockTelemetry};
use crate::{Lzma2Error, Result};

use task::BlockTask;

pub const BLOCK_SIZE_MIN: usize = 1 << 20;
pub const BLOCK_SIZE_MAX: usize = 256 << 20;
pub const AFFINITY_MAX: usize = 255;

/// Blocks this many times larger than the dictionary gain little from
/// carrying history across block boundaries.
const AUTO_DICT_RATIO: usize = 64;
const SLOT_POLL: Duration = Duration::from_millis(50);

/// How dictionary history crosses block boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DictMode {
    /// Every block starts with an empty dictionary.
    None,
    /// The previous block's tail is loaded into the task's encoder when the
    /// block is submitted.
    Set,
    /// The previous block's tail travels with the block and is loaded by the
    /// worker.
    AsyncSet,
    /// Picks one of the above from the block and dictionary sizes.
    #[default]
    Auto,
}

impl DictMode {
    /// Resolves [`DictMode::Auto`]; concrete modes are returned unchanged.
    pub fn resolve(self, block_size: usize, dict_size: usize) -> Self {
        self.history(block_size, dict_size).into()
    }

    pub(crate) fn history(self, block_size: usize, dict_size: usize) -> BlockHistory {
        match self {
            Self::None => BlockHistory::Cold,
            Self::Set => BlockHistory::Loaded,
            Self::AsyncSet => BlockHistory::Carried,
            Self::Auto if block_size >= dict_size.saturating_mul(AUTO_DICT_RATIO) => {
                BlockHistory::Cold
            }
            Self::Auto => BlockHistory::Carried,
        }
    }
}

/// A resolved [`DictMode`]: what a block task does with the previous
/// block's tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockHistory {
    /// No history; every block resets the dictionary.
    Cold,
    /// History is loaded into the encoder on the submitting thread.
    Loaded,
    /// History travels in the task's input and the worker loads it.
    Carried,
}

impl From<BlockHistory> for DictMode {
    fn from(history: BlockHistory) -> Self {
        match history {
            BlockHistory::Cold => DictMode::None,
            BlockHistory::Loaded => DictMode::Set,
            BlockHistory::Carried => DictMode::AsyncSet,
        }
    }
}

/// Tuning for a [`Lzma2Parallel`] coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Uncompressed bytes per block; 0 derives it from the dictionary size.
    pub block_size: usize,
    pub dict_mode: DictMode,
    /// Most blocks alive at once, counting both running and unflushed ones.
    pub affinity: usize,
    /// Accept block sizes below [`BLOCK_SIZE_MIN`].
    pub allow_small_blocks: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            dict_mode: DictMode::Auto,
            affinity: num_cpus::get().clamp(1, AFFINITY_MAX),
            allow_small_blocks: false,
        }
    }
}

impl ParallelConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=AFFINITY_MAX).contains(&self.affinity) {
            return Err(Lzma2Error::InvalidOptions(format!(
                "affinity must be in 1..={AFFINITY_MAX}: {}",
                self.affinity
            )));
        }
        if self.block_size != 0 {
            let min = if self.allow_small_blocks {
                1
            } else {
                BLOCK_SIZE_MIN
            };
            if !(min..=BLOCK_SIZE_MAX).contains(&self.block_size) {
                return Err(Lzma2Error::InvalidOptions(format!(
                    "block size must be in {min}..={BLOCK_SIZE_MAX}: {}",
                    self.block_size
                )));
            }
        }
        Ok(())
    }
}

/// Block size used when none is configured: four dictionaries, clamped to
/// the supported range, never below one dictionary, in whole MiB.
pub fn auto_block_size(dict_size: usize) -> usize {
    let size = dict_size
        .saturating_mul(4)
        .clamp(BLOCK_SIZE_MIN, BLOCK_SIZE_MAX)
        .max(dict_size);
    size.div_ceil(BLOCK_SIZE_MIN) * BLOCK_SIZE_MIN
}

#[derive(Debug)]
struct TaskSlots {
    idle: Vec<BlockTask>,
    free: usize,
    live_writers: usize,
}

/// Point-in-time view of a coordinator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CoordinatorCounters {
    pub live_writers: usize,
    pub idle_tasks: usize,
    pub free_slots: usize,
    pub blocks_submitted: u64,
    pub blocks_flushed: u64,
}

/// Shared state for block-parallel LZMA2 streams.
///
/// Holds the codec options, the resolved block size and dictionary mode, the
/// executor, the buffer pool and the task slots. At most `affinity` block
/// tasks exist at any time; a task holds its slot from submission until its
/// output has been written to the sink or discarded.
pub struct Lzma2Parallel {
    options: Lzma2Options,
    block_size: usize,
    history: BlockHistory,
    affinity: usize,
    executor: Arc<TaskExecutor>,
    pool: Arc<BufferPool>,
    telemetry: Arc<dyn BlockTelemetry>,
    slots: Mutex<TaskSlots>,
    slot_freed: Condvar,
    blocks_submitted: AtomicU64,
    blocks_flushed: AtomicU64,
}

impl Lzma2Parallel {
    /// Creates a coordinator with one worker per CPU and an unbounded pool.
    pub fn new(options: Lzma2Options, config: ParallelConfig) -> Result<Self> {
        let executor = Arc::new(TaskExecutor::new(num_cpus::get())?);
        let pool = Arc::new(BufferPool::new(config.affinity.max(1) * 3 + 2));
        Self::with_resources(
            options,
            config,
            executor,
            pool,
            Arc::new(DefaultBlockTelemetry),
        )
    }

    /// Creates a coordinator around caller-provided resources.
    pub fn with_resources(
        options: Lzma2Options,
        config: ParallelConfig,
        executor: Arc<TaskExecutor>,
        pool: Arc<BufferPool>,
        telemetry: Arc<dyn BlockTelemetry>,
    ) -> Result<Self> {
        config.validate()?;
        let dict_size = options.dict_size() as usize;
        let block_size = if config.block_size == 0 {
            auto_block_size(dict_size)
        } else {
            config.block_size
        };
        let history = config.dict_mode.history(block_size, dict_size);

        tracing::debug!(
            target: tags::LOG_PARALLEL,
            options = %options,
            block_size,
            dict_mode = ?DictMode::from(history),
            affinity = config.affinity,
            workers = executor.num_workers(),
            "parallel coordinator created"
        );

        Ok(Self {
            options,
            block_size,
            history,
            affinity: config.affinity,
            executor,
            pool,
            telemetry,
            slots: Mutex::new(TaskSlots {
                idle: Vec::new(),
                free: config.affinity,
                live_writers: 0,
            }),
            slot_freed: Condvar::new(),
            blocks_submitted: AtomicU64::new(0),
            blocks_flushed: AtomicU64::new(0),
        })
    }

    /// Opens a stream that writes into `sink`.
    pub fn writer<W>(self: &Arc<Self>, sink: W) -> Result<ParallelWriter<W>>
    where
        W: Lzma2Sink + Send + 'static,
    {
        self.register_writer();
        ParallelWriter::new(Arc::clone(self), sink).inspect_err(|_| self.unregister_writer())
    }

    pub fn options(&self) -> &Lzma2Options {
        &self.options
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The dictionary mode in effect, with [`DictMode::Auto`] resolved.
    pub fn dict_mode(&self) -> DictMode {
        self.history.into()
    }

    pub(crate) fn history(&self) -> BlockHistory {
        self.history
    }

    pub fn affinity(&self) -> usize {
        self.affinity
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Worst-case memory on top of the caller's own buffers: every task slot
    /// filled, plus one stream's accumulation buffer.
    pub fn extra_memory_usage_bytes(&self) -> usize {
        let dict_size = self.options.dict_size() as usize;
        let per_task = task::input_capacity(self.history, dict_size, self.block_size)
            + task::output_capacity(self.block_size)
            + self.options.encoder_memory_usage();
        self.affinity * per_task + self.writer_buffer_size()
    }

    pub fn counters(&self) -> CoordinatorCounters {
        let slots = lock_unpoisoned(&self.slots);
        CoordinatorCounters {
            live_writers: slots.live_writers,
            idle_tasks: slots.idle.len(),
            free_slots: slots.free,
            blocks_submitted: self.blocks_submitted.load(Ordering::Acquire),
            blocks_flushed: self.blocks_flushed.load(Ordering::Acquire),
        }
    }

    /// Size of a stream's accumulation buffer: dictionary tail plus block.
    pub(crate) fn writer_buffer_size(&self) -> usize {
        match self.history {
            BlockHistory::Cold => self.block_size,
            _ => self.options.dict_size() as usize + self.block_size,
        }
    }

    pub(crate) fn telemetry(&self) -> &Arc<dyn BlockTelemetry> {
        &self.telemetry
    }

    fn register_writer(&self) {
        let mut slots = lock_unpoisoned(&self.slots);
        slots.live_writers += 1;
        telemetry::increment_counter(tags::METRIC_STREAM_OPEN_COUNT, 1);
    }

    /// Drops the last writer's resources: idle tasks go back to the pool and
    /// the pool is purged, leaving the coordinator cold.
    pub(crate) fn unregister_writer(&self) {
        let mut slots = lock_unpoisoned(&self.slots);
        slots.live_writers = slots.live_writers.saturating_sub(1);
        if slots.live_writers > 0 {
            return;
        }
        let idle = std::mem::take(&mut slots.idle);
        slots.free = self.affinity;
        drop(slots);

        let released = idle.len();
        drop(idle);
        let purged = self.pool.purge();
        tracing::debug!(target: tags::LOG_PARALLEL, released, purged, "coordinator went cold");
    }

    /// Takes a task slot, waiting while all of them are in use.
    ///
    /// `aborted` is polled while waiting; once it reports a failure the wait
    /// ends with that error.
    pub(crate) fn acquire_task<F>(&self, aborted: F) -> Result<BlockTask>
    where
        F: Fn() -> Option<Lzma2Error>,
    {
        let started_at = Instant::now();
        let mut slots = lock_unpoisoned(&self.slots);
        let idle = loop {
            if let Some(err) = aborted() {
                return Err(err);
            }
            if slots.free > 0 {
                slots.free -= 1;
                break slots.idle.pop();
            }
            slots = wait_timeout_unpoisoned(&self.slot_freed, slots, SLOT_POLL).0;
        };
        drop(slots);

        telemetry::record_duration_us(tags::METRIC_BLOCK_SUBMIT_WAIT_US, started_at.elapsed());

        match idle {
            Some(task) => Ok(task),
            None => BlockTask::new(&self.options, self.history, self.block_size, &self.pool)
                .inspect_err(|_| self.release_task(None)),
        }
    }

    /// Returns a slot, parking `task` for reuse when one is given.
    pub(crate) fn release_task(&self, task: Option<BlockTask>) {
        let mut slots = lock_unpoisoned(&self.slots);
        if let Some(task) = task {
            if slots.live_writers > 0 {
                slots.idle.push(task);
            }
        }
        slots.free = (slots.free + 1).min(self.affinity);
        drop(slots);
        self.slot_freed.notify_all();
    }

    /// Wakes writers waiting for a slot so they can observe a cancellation.
    pub(crate) fn wake_waiters(&self) {
        let _slots = lock_unpoisoned(&self.slots);
        self.slot_freed.notify_all();
    }

    pub(crate) fn note_submitted(&self) {
        self.blocks_submitted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_flushed(&self) {
        self.blocks_flushed.fetch_add(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Lzma2Parallel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lzma2Parallel")
            .field("options", &self.options)
            .field("block_size", &self.block_size)
            .field("history", &self.history)
            .field("affinity", &self.affinity)
            .field("counters", &self.counters())
            .finish()
    }
}
