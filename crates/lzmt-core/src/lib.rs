//! LZMA2 stream writers: a single-threaded chunker and a block-parallel
//! pipeline that produces the same wire format.

pub mod buffer;
pub mod chunk;
pub mod core;
pub mod error;
pub mod lzma;
pub mod options;
pub mod parallel;
pub mod sink;
pub mod stream;
pub(crate) mod sync;
pub mod telemetry;
pub mod types;

pub use buffer::{BufferPool, PoolMetricsSnapshot, PooledBuffer};
pub use chunk::{ChunkEncoder, ResetState};
pub use crate::core::{ExecutorRuntimeSnapshot, TaskExecutor};
pub use error::Lzma2Error;
pub use lzma::{BlockEncoder, LzmaEncoder, RawEncoder};
pub use options::{Lzma2Options, Mode};
pub use parallel::{
    AbortHandle, CoordinatorCounters, DictMode, Lzma2Parallel, ParallelConfig, ParallelWriter,
    StreamState,
};
pub use sink::{CountingSink, Lzma2Sink, PlainSink, SharedSink};
pub use stream::Lzma2Writer;
pub use telemetry::worker::{
    BlockTelemetry, DefaultBlockTelemetry, DefaultWorkerTelemetry, WorkerTelemetry,
};
pub use types::{Result, StreamStats};
