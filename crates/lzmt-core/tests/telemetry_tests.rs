#![cfg(feature = "telemetry")]

mod support;

use std::sync::Arc;

use lzmt_core::telemetry::{self, tags};
use lzmt_core::{
    BufferPool, DefaultBlockTelemetry, DictMode, Lzma2Options, Lzma2Parallel, Lzma2Writer,
    ParallelConfig, TaskExecutor,
};
use support::{TestResult, random_bytes, text_bytes};

// The registry is process-wide, so everything that reads it lives in this one
// test and compares against a baseline.
#[test]
fn writers_report_chunks_blocks_and_buffers() -> TestResult {
    let before = telemetry::snapshot();

    let options = Lzma2Options::preset(1)?;
    let mut data = text_bytes(200_000, 1);
    data.extend_from_slice(&random_bytes(100_000, 2));
    let mut writer = Lzma2Writer::new(Vec::new(), &options)?;
    writer.write_bytes(&data)?;
    writer.finish()?;
    let stats = writer.stats();
    writer.close()?;

    let after = telemetry::snapshot();
    let (was, now) = (before.chunks(), after.chunks());
    assert_eq!(now.lzma_chunks - was.lzma_chunks, stats.lzma_chunks);
    assert_eq!(now.raw_chunks - was.raw_chunks, stats.raw_chunks);
    assert!(stats.raw_chunks > 0);
    assert_eq!(now.uncompressed_bytes - was.uncompressed_bytes, data.len() as u64);
    // The end marker is counted by the writer, not as a chunk.
    assert_eq!(now.compressed_bytes - was.compressed_bytes, stats.compressed_bytes - 1);
    assert!(after.counters.contains_key(tags::METRIC_CHUNK_LZMA_COUNT));

    let block_size = 64 << 10;
    let coordinator = Arc::new(Lzma2Parallel::with_resources(
        options,
        ParallelConfig {
            block_size,
            dict_mode: DictMode::AsyncSet,
            affinity: 2,
            allow_small_blocks: true,
        },
        Arc::new(TaskExecutor::new(2)?),
        Arc::new(BufferPool::new(8)),
        Arc::new(DefaultBlockTelemetry),
    )?);
    let mut writer = coordinator.writer(Vec::new())?;
    writer.write_bytes(&text_bytes(block_size * 5, 3))?;
    writer.close()?;

    let last = telemetry::snapshot();
    let (was, now) = (after.blocks(), last.blocks());
    assert_eq!(now.submitted - was.submitted, 5);
    assert_eq!(now.finished - was.finished, 5);
    assert_eq!(now.flushed - was.flushed, 5);
    assert_eq!(now.failed, was.failed);
    assert_eq!(now.in_flight, 0);
    let latency = now.latency_us.ok_or("no block latency recorded")?;
    assert!(latency.count >= 5);
    assert!(latency.min <= latency.max);

    // Each block task takes its input and output buffers from the pool.
    assert!(last.buffers().created >= after.buffers().created + 2);
    Ok(())
}
