use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::buffer::PooledBuffer;
use crate::chunk::END_MARKER;
use crate::core::executor::panic_message;
use crate::parallel::reorder::ReorderRing;
use crate::parallel::task::{BlockPlan, BlockTask};
use crate::parallel::{BlockHistory, Lzma2Parallel};
use crate::sink::Lzma2Sink;
use crate::sync::{lock_unpoisoned, wait_unpoisoned};
use crate::telemetry;
use crate::telemetry::tags;
use crate::{Lzma2Error, Result, StreamStats};

/// Lifecycle of a parallel stream.
///
/// `Open → FinishRequested → Draining → Closed` is the normal path;
/// `Aborted` can be entered from any state except `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamState {
    /// Accepting input.
    Open = 0,
    /// The last block is submitted; waiting for running blocks.
    FinishRequested = 1,
    /// Every block is flushed; the end marker is being written.
    Draining = 2,
    /// The end marker has been written.
    Closed = 3,
    /// A block failed or the stream was cancelled.
    Aborted = 4,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::FinishRequested,
            2 => Self::Draining,
            3 => Self::Closed,
            _ => Self::Aborted,
        }
    }
}

/// State every party of one stream can see: the caller, the workers
/// running its blocks and any [`AbortHandle`].
struct StreamControl {
    state: AtomicU8,
    failure: Mutex<Option<Lzma2Error>>,
    coordinator: Arc<Lzma2Parallel>,
}

impl StreamControl {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The recorded failure, once the stream is aborted.
    fn failure(&self) -> Option<Lzma2Error> {
        if self.state() != StreamState::Aborted {
            return None;
        }
        Some(
            lock_unpoisoned(&self.failure)
                .as_ref()
                .map_or(Lzma2Error::Cancelled, Lzma2Error::duplicate),
        )
    }

    /// Records `err` (the first one wins) and aborts the stream.
    fn fail(&self, err: Lzma2Error) {
        {
            let mut failure = lock_unpoisoned(&self.failure);
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        let aborted = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                match StreamState::from_u8(state) {
                    StreamState::Closed | StreamState::Aborted => None,
                    _ => Some(StreamState::Aborted as u8),
                }
            })
            .is_ok();

        if aborted {
            telemetry::increment_counter(tags::METRIC_STREAM_ABORT_COUNT, 1);
            if let Some(err) = lock_unpoisoned(&self.failure).as_ref() {
                tracing::debug!(target: tags::LOG_PARALLEL, error = %err, "parallel stream aborted");
            }
            self.coordinator.wake_waiters();
        }
    }
}

/// Cancels a [`ParallelWriter`] from another thread.
///
/// After `abort`, blocks that have not been written are dropped, a writer
/// waiting for a task slot wakes up, and every later call on the writer
/// reports [`Lzma2Error::Cancelled`].
#[derive(Clone)]
pub struct AbortHandle {
    control: Arc<StreamControl>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.control.fail(Lzma2Error::Cancelled);
    }

    pub fn state(&self) -> StreamState {
        self.control.state()
    }
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("state", &self.state())
            .finish()
    }
}

struct OutputState<W> {
    sink: Option<W>,
    ring: ReorderRing<BlockTask>,
    stats: StreamStats,
}

struct Shared<W> {
    control: Arc<StreamControl>,
    output: Mutex<OutputState<W>>,
    running: Mutex<usize>,
    idle: Condvar,
}

/// Decrements the running count however `run_task` exits.
struct RunningGuard<'a, W> {
    shared: &'a Shared<W>,
}

impl<W> Drop for RunningGuard<'_, W> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared
                .control
                .fail(Lzma2Error::Worker("block flush panicked".to_string()));
        }
        let mut running = lock_unpoisoned(&self.shared.running);
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.shared.idle.notify_all();
        }
    }
}

impl<W: Lzma2Sink + Send + 'static> Shared<W> {
    fn coordinator(&self) -> &Lzma2Parallel {
        &self.control.coordinator
    }

    fn wait_idle(&self) {
        let mut running = lock_unpoisoned(&self.running);
        while *running > 0 {
            running = wait_unpoisoned(&self.idle, running);
        }
    }

    /// Worker-side body of one block.
    fn run_task(&self, mut task: BlockTask) {
        let _guard = RunningGuard { shared: self };
        let coordinator = self.coordinator();
        let telemetry = coordinator.telemetry();
        let control = &self.control;
        let id = task.id();
        let started_at = Instant::now();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            telemetry.on_block_started(id, task.payload_len());
            task.compress(coordinator.options().effective_preset_dict(), || {
                control.failure().map_or(Ok(()), Err)
            })
        }));
        let result = outcome.unwrap_or_else(|payload| {
            Err(Lzma2Error::Worker(format!(
                "block {id} panicked: {}",
                panic_message(payload.as_ref())
            )))
        });

        match result {
            Ok(()) => {
                telemetry.on_block_finished(
                    id,
                    started_at.elapsed(),
                    task.payload_len(),
                    task.output().len(),
                );
                self.task_finished(task);
            }
            Err(err) => {
                telemetry.on_block_failed(id, started_at.elapsed());
                drop(task);
                coordinator.release_task(None);
                self.task_failed(err.with_context(format!("compressing block {id}")));
            }
        }
    }

    /// Writes `task` and every block now contiguous with it, in id order.
    fn task_finished(&self, task: BlockTask) {
        let coordinator = self.coordinator();
        let mut output = lock_unpoisoned(&self.output);
        if self.control.state() == StreamState::Aborted {
            let held = output.ring.drain();
            drop(output);
            coordinator.release_task(Some(task));
            held.into_iter()
                .for_each(|task| coordinator.release_task(Some(task)));
            return;
        }

        let ready = match output.ring.push(task.id(), task) {
            Ok(ready) => ready,
            Err(err) => {
                drop(output);
                coordinator.release_task(None);
                self.task_failed(err);
                return;
            }
        };

        let mut ready = ready.into_iter();
        while let Some(task) = ready.next() {
            let written = match output.sink.as_mut() {
                Some(sink) => sink.write_all(task.output()).map_err(Lzma2Error::from),
                None => Err(Lzma2Error::IllegalState("stream closed")),
            };
            match written {
                Ok(()) => {
                    output.stats.absorb(task.stats());
                    coordinator
                        .telemetry()
                        .on_block_flushed(task.id(), task.output().len());
                    coordinator.note_flushed();
                    coordinator.release_task(Some(task));
                }
                Err(err) => {
                    let id = task.id();
                    let mut discarded: Vec<_> = ready.collect();
                    discarded.extend(output.ring.drain());
                    drop(output);
                    coordinator.release_task(Some(task));
                    discarded
                        .into_iter()
                        .for_each(|task| coordinator.release_task(Some(task)));
                    self.task_failed(err.with_context(format!("writing block {id}")));
                    return;
                }
            }
        }
    }

    fn task_failed(&self, err: Lzma2Error) {
        if !err.is_cancelled() {
            tracing::warn!(target: tags::LOG_PARALLEL, error = %err, "parallel block failed");
        }
        self.control.fail(err);
        let held = lock_unpoisoned(&self.output).ring.drain();
        let coordinator = self.coordinator();
        held.into_iter()
            .for_each(|task| coordinator.release_task(Some(task)));
    }
}

/// One LZMA2 stream compressed block by block on a [`Lzma2Parallel`].
///
/// Input accumulates in a buffer laid out as `[history][block]`; a full
/// block is copied into a task and compressed on the executor while the
/// writer keeps accepting input. Blocks are written to the sink in order.
/// Submitting waits while every task slot is taken.
pub struct ParallelWriter<W: Lzma2Sink + Send + 'static> {
    shared: Arc<Shared<W>>,
    buffer: Option<PooledBuffer>,
    history_len: usize,
    next_id: u64,
    stream_pos: u64,
    preset_len: u64,
    finished: bool,
    closed: bool,
}

impl<W: Lzma2Sink + Send + 'static> ParallelWriter<W> {
    pub(crate) fn new(coordinator: Arc<Lzma2Parallel>, sink: W) -> Result<Self> {
        let buffer = coordinator
            .pool()
            .acquire(coordinator.writer_buffer_size())?;
        let preset_len = coordinator.options().effective_preset_dict().len() as u64;
        let ring = ReorderRing::new(coordinator.affinity());

        tracing::debug!(
            target: tags::LOG_STREAM,
            block_size = coordinator.block_size(),
            dict_mode = ?coordinator.dict_mode(),
            preset_dict = preset_len,
            "parallel stream opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                control: Arc::new(StreamControl {
                    state: AtomicU8::new(StreamState::Open as u8),
                    failure: Mutex::new(None),
                    coordinator,
                }),
                output: Mutex::new(OutputState {
                    sink: Some(sink),
                    ring,
                    stats: StreamStats::default(),
                }),
                running: Mutex::new(0),
                idle: Condvar::new(),
            }),
            buffer: Some(buffer),
            history_len: 0,
            next_id: 0,
            stream_pos: 0,
            preset_len,
            finished: false,
            closed: false,
        })
    }

    /// Buffers `data`, submitting a block each time one fills up.
    ///
    /// # Errors
    /// [`Lzma2Error::Cancelled`] once the stream is finishing, closed or
    /// aborted, or the error that failed an earlier block.
    pub fn write_bytes(&mut self, mut data: &[u8]) -> Result<()> {
        self.check_writable()?;
        let block_size = self.shared.coordinator().block_size();
        while !data.is_empty() {
            let Some(buffer) = self.buffer.as_mut() else {
                return Err(Lzma2Error::IllegalState("stream closed"));
            };
            let limit = self.history_len + block_size;
            let take = (limit - buffer.len()).min(data.len());
            buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if buffer.len() == limit {
                self.submit_block()?;
            }
        }
        Ok(())
    }

    /// Submits the partial block, waits until every block is written, then
    /// flushes the sink. The stream stays open.
    pub fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        self.submit_block()?;
        self.shared.wait_idle();
        if let Some(err) = self.shared.control.failure() {
            return Err(err);
        }
        let mut output = lock_unpoisoned(&self.shared.output);
        if let Some(sink) = output.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    /// Submits the last block, waits for all blocks, then writes the end
    /// marker and finishes the sink. Calling it again is a no-op.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.check_writable()?;
        let submitted = self.submit_block();
        self.shared
            .control
            .transition(StreamState::Open, StreamState::FinishRequested);
        self.shared.wait_idle();
        submitted?;
        if let Some(err) = self.shared.control.failure() {
            return Err(err);
        }

        let control = &self.shared.control;
        control.transition(StreamState::FinishRequested, StreamState::Draining);
        let stats = {
            let mut output = lock_unpoisoned(&self.shared.output);
            let ended = match output.sink.as_mut() {
                Some(sink) => sink.write_all(&[END_MARKER]).and_then(|()| sink.finish()),
                None => Ok(()),
            };
            if let Err(err) = ended {
                drop(output);
                let err = Lzma2Error::from(err);
                control.fail(err.duplicate());
                return Err(err);
            }
            output.stats.compressed_bytes += 1;
            output.stats
        };
        control.transition(StreamState::Draining, StreamState::Closed);
        self.finished = true;

        telemetry::increment_counter(tags::METRIC_STREAM_FINISH_COUNT, 1);
        tracing::debug!(
            target: tags::LOG_STREAM,
            uncompressed = stats.uncompressed_bytes,
            compressed = stats.compressed_bytes,
            blocks = stats.blocks,
            "parallel stream finished"
        );
        Ok(())
    }

    /// Finishes the stream unless it already failed, then closes the sink
    /// and returns the writer's resources to the coordinator.
    ///
    /// Safe to call repeatedly; after a failure it discards unwritten blocks
    /// and reports the failure once more.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let finished = match self.shared.control.failure() {
            Some(err) => Err(err),
            None => self.finish(),
        };
        let released = self.release(true);
        finished.and(released)
    }

    /// Finishes the stream and hands back the sink without closing it.
    pub fn finish_into_inner(mut self) -> Result<W> {
        self.finish()?;
        self.release(false)?;
        lock_unpoisoned(&self.shared.output)
            .sink
            .take()
            .ok_or(Lzma2Error::IllegalState("stream closed"))
    }

    /// Handle that cancels this stream from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            control: Arc::clone(&self.shared.control),
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.control.state()
    }

    /// Totals of the blocks written so far.
    pub fn stats(&self) -> StreamStats {
        lock_unpoisoned(&self.shared.output).stats
    }

    /// Blocks submitted so far.
    pub fn blocks_submitted(&self) -> u64 {
        self.next_id
    }

    fn check_writable(&self) -> Result<()> {
        if let Some(err) = self.shared.control.failure() {
            return Err(err);
        }
        if self.finished || self.closed || self.state() != StreamState::Open {
            return Err(Lzma2Error::Cancelled);
        }
        Ok(())
    }

    fn submit_block(&mut self) -> Result<()> {
        let result = self.try_submit_block();
        if let Err(err) = &result {
            self.shared.control.fail(err.duplicate());
        }
        result
    }

    fn try_submit_block(&mut self) -> Result<()> {
        let coordinator = Arc::clone(&self.shared.control.coordinator);
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(Lzma2Error::IllegalState("stream closed"));
        };
        let payload_len = buffer.len() - self.history_len;
        if payload_len == 0 {
            return Ok(());
        }

        let control = Arc::clone(&self.shared.control);
        let mut task = coordinator.acquire_task(|| control.failure())?;
        let id = self.next_id;
        let kind = coordinator.history();
        task.load(&BlockPlan {
            id,
            kind,
            position: self.preset_len + self.stream_pos,
            history: &buffer[..self.history_len],
            payload: &buffer[self.history_len..],
            preset: coordinator.options().effective_preset_dict(),
        });
        self.next_id += 1;
        self.stream_pos += payload_len as u64;

        let keep = match kind {
            BlockHistory::Cold => 0,
            _ => buffer.len().min(coordinator.options().dict_size() as usize),
        };
        let start = buffer.len() - keep;
        buffer.copy_within(start.., 0);
        buffer.truncate(keep);
        self.history_len = keep;

        *lock_unpoisoned(&self.shared.running) += 1;
        let shared = Arc::clone(&self.shared);
        if let Err(err) = coordinator
            .executor()
            .execute(move || shared.run_task(task))
        {
            drop(RunningGuard {
                shared: &*self.shared,
            });
            coordinator.release_task(None);
            return Err(err);
        }

        coordinator.note_submitted();
        telemetry::increment_counter(tags::METRIC_BLOCK_SUBMIT_COUNT, 1);
        tracing::trace!(target: tags::LOG_PARALLEL, block_id = id, payload_len, "block submitted");
        Ok(())
    }

    /// Waits for running blocks, drops unwritten ones and hands the writer's
    /// resources back. Closes the sink when `close_sink` is set.
    fn release(&mut self, close_sink: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.finished = true;
        self.shared.wait_idle();

        let coordinator = self.shared.coordinator();
        let (held, sink) = {
            let mut output = lock_unpoisoned(&self.shared.output);
            let held = output.ring.drain();
            let sink = if close_sink { output.sink.take() } else { None };
            (held, sink)
        };
        held.into_iter()
            .for_each(|task| coordinator.release_task(Some(task)));
        self.buffer = None;
        coordinator.unregister_writer();

        if let Some(mut sink) = sink {
            sink.close()?;
        }
        Ok(())
    }
}

impl<W: Lzma2Sink + Send + 'static> Write for ParallelWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ParallelWriter::flush(self)?;
        Ok(())
    }
}

impl<W: Lzma2Sink + Send + 'static> Drop for ParallelWriter<W> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                tracing::debug!(target: tags::LOG_STREAM, error = %err, "close on drop failed");
            }
        }
    }
}

impl<W: Lzma2Sink + Send + 'static> std::fmt::Debug for ParallelWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelWriter")
            .field("state", &self.state())
            .field("next_id", &self.next_id)
            .field("stream_pos", &self.stream_pos)
            .field("stats", &self.stats())
            .finish()
    }
}
