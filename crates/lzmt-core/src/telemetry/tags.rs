/// Profiling target for buffer pool operations.
pub const PROFILE_BUFFER: &str = "lzmt.profile.buffer";
/// Profiling target for executor worker threads.
pub const PROFILE_WORKER: &str = "lzmt.profile.worker";
/// Profiling target for chunk emission.
pub const PROFILE_CHUNK: &str = "lzmt.profile.chunk";
/// Profiling target for parallel block tasks.
pub const PROFILE_BLOCK: &str = "lzmt.profile.block";
/// Log target for stream lifecycle events.
pub const LOG_STREAM: &str = "lzmt.stream";
/// Log target for the parallel coordinator.
pub const LOG_PARALLEL: &str = "lzmt.parallel";

/// Global system-level tag shared by all profiling events.
pub const TAG_SYSTEM: &str = "system";
/// Logical tag for buffer subsystem events.
pub const TAG_BUFFER: &str = "buffer";
/// Logical tag for worker subsystem events.
pub const TAG_WORKER: &str = "worker";
/// Logical tag for chunk framing events.
pub const TAG_CHUNK: &str = "chunk";
/// Logical tag for block task events.
pub const TAG_BLOCK: &str = "block";

pub const METRIC_BUFFER_ACQUIRE_CREATED_COUNT: &str = "lzmt.buffer.acquire.created.count";
pub const METRIC_BUFFER_ACQUIRE_RECYCLED_COUNT: &str = "lzmt.buffer.acquire.recycled.count";
pub const METRIC_BUFFER_ACQUIRE_REJECTED_COUNT: &str = "lzmt.buffer.acquire.rejected.count";
pub const METRIC_BUFFER_RECYCLE_OK_COUNT: &str = "lzmt.buffer.recycle.ok.count";
pub const METRIC_BUFFER_RECYCLE_DROPPED_COUNT: &str = "lzmt.buffer.recycle.dropped.count";
pub const METRIC_BUFFER_ACQUIRE_LATENCY_US: &str = "lzmt.buffer.acquire.latency_us";
pub const METRIC_BUFFER_LIVE_BYTES: &str = "lzmt.buffer.live_bytes";

pub const METRIC_CHUNK_LZMA_COUNT: &str = "lzmt.chunk.lzma.count";
pub const METRIC_CHUNK_RAW_COUNT: &str = "lzmt.chunk.raw.count";
pub const METRIC_CHUNK_UNCOMPRESSED_BYTES: &str = "lzmt.chunk.uncompressed_bytes";
pub const METRIC_CHUNK_COMPRESSED_BYTES: &str = "lzmt.chunk.compressed_bytes";

pub const METRIC_BLOCK_SUBMIT_COUNT: &str = "lzmt.block.submit.count";
pub const METRIC_BLOCK_SUBMIT_WAIT_US: &str = "lzmt.block.submit.wait_us";
pub const METRIC_BLOCK_FINISH_COUNT: &str = "lzmt.block.finish.count";
pub const METRIC_BLOCK_FAIL_COUNT: &str = "lzmt.block.fail.count";
pub const METRIC_BLOCK_FLUSH_COUNT: &str = "lzmt.block.flush.count";
pub const METRIC_BLOCK_LATENCY_US: &str = "lzmt.block.latency_us";
pub const METRIC_BLOCK_PENDING: &str = "lzmt.block.pending";

pub const METRIC_STREAM_OPEN_COUNT: &str = "lzmt.stream.open.count";
pub const METRIC_STREAM_FINISH_COUNT: &str = "lzmt.stream.finish.count";
pub const METRIC_STREAM_ABORT_COUNT: &str = "lzmt.stream.abort.count";

pub const METRIC_WORKER_TASK_START_COUNT: &str = "lzmt.worker.task.start.count";
pub const METRIC_WORKER_TASK_FINISH_COUNT: &str = "lzmt.worker.task.finish.count";
pub const METRIC_WORKER_TASK_FAIL_COUNT: &str = "lzmt.worker.task.fail.count";
pub const METRIC_WORKER_TASK_LATENCY_US: &str = "lzmt.worker.task.latency_us";
pub const METRIC_WORKER_QUEUE_DEPTH: &str = "lzmt.worker.queue.depth";
pub const METRIC_WORKER_ACTIVE_COUNT: &str = "lzmt.worker.active.count";
