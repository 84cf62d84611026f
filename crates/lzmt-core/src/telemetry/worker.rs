use std::time::Duration;

use crate::telemetry;
use crate::telemetry::profile;
use crate::telemetry::tags;

const PROFILE_TAG_STACK_WORKER: [&str; 2] = [tags::TAG_SYSTEM, tags::TAG_WORKER];
const PROFILE_TAG_STACK_BLOCK: [&str; 2] = [tags::TAG_SYSTEM, tags::TAG_BLOCK];

/// Telemetry contract for executor threads.
///
/// The executor calls these hooks around every job it runs, without knowing
/// what the job does.
pub trait WorkerTelemetry: Send + Sync {
    fn on_queue_depth(&self, worker_id: usize, depth: usize);
    fn on_task_started(&self, worker_id: usize);
    fn on_task_finished(&self, worker_id: usize, elapsed: Duration);
    fn on_task_failed(&self, worker_id: usize, elapsed: Duration);
}

/// Default telemetry implementation that reports worker metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorkerTelemetry;

impl WorkerTelemetry for DefaultWorkerTelemetry {
    fn on_queue_depth(&self, _worker_id: usize, depth: usize) {
        telemetry::set_gauge(tags::METRIC_WORKER_QUEUE_DEPTH, depth as u64);
    }

    fn on_task_started(&self, _worker_id: usize) {
        telemetry::increment_counter(tags::METRIC_WORKER_TASK_START_COUNT, 1);
        telemetry::add_gauge(tags::METRIC_WORKER_ACTIVE_COUNT, 1);
    }

    fn on_task_finished(&self, _worker_id: usize, elapsed: Duration) {
        telemetry::increment_counter(tags::METRIC_WORKER_TASK_FINISH_COUNT, 1);
        telemetry::record_duration_us(tags::METRIC_WORKER_TASK_LATENCY_US, elapsed);
        telemetry::sub_gauge(tags::METRIC_WORKER_ACTIVE_COUNT, 1);
        profile::event(
            tags::PROFILE_WORKER,
            &PROFILE_TAG_STACK_WORKER,
            "task_finish",
            "ok",
            profile::duration_us(elapsed),
            "worker task finished",
        );
    }

    fn on_task_failed(&self, _worker_id: usize, elapsed: Duration) {
        telemetry::increment_counter(tags::METRIC_WORKER_TASK_FAIL_COUNT, 1);
        telemetry::record_duration_us(tags::METRIC_WORKER_TASK_LATENCY_US, elapsed);
        telemetry::sub_gauge(tags::METRIC_WORKER_ACTIVE_COUNT, 1);
        profile::event(
            tags::PROFILE_WORKER,
            &PROFILE_TAG_STACK_WORKER,
            "task_finish",
            "error",
            profile::duration_us(elapsed),
            "worker task panicked",
        );
    }
}

/// Telemetry contract for parallel block tasks.
///
/// `on_block_started` runs on the worker thread immediately before the block
/// is compressed, so a slow implementation delays that block and nothing else.
pub trait BlockTelemetry: Send + Sync {
    fn on_block_started(&self, block_id: u64, uncompressed: usize);
    fn on_block_finished(&self, block_id: u64, elapsed: Duration, uncompressed: usize, compressed: usize);
    fn on_block_failed(&self, block_id: u64, elapsed: Duration);
    fn on_block_flushed(&self, block_id: u64, compressed: usize);
}

/// Default telemetry implementation that reports block metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBlockTelemetry;

impl BlockTelemetry for DefaultBlockTelemetry {
    fn on_block_started(&self, _block_id: u64, _uncompressed: usize) {
        telemetry::add_gauge(tags::METRIC_BLOCK_PENDING, 1);
    }

    fn on_block_finished(&self, block_id: u64, elapsed: Duration, uncompressed: usize, compressed: usize) {
        telemetry::increment_counter(tags::METRIC_BLOCK_FINISH_COUNT, 1);
        telemetry::record_duration_us(tags::METRIC_BLOCK_LATENCY_US, elapsed);
        telemetry::sub_gauge(tags::METRIC_BLOCK_PENDING, 1);

        let elapsed_us = profile::duration_us(elapsed);
        profile::event(
            tags::PROFILE_BLOCK,
            &PROFILE_TAG_STACK_BLOCK,
            "compress",
            "ok",
            elapsed_us,
            "block compressed",
        );
        #[cfg(feature = "profiling")]
        if profile::is_tag_stack_enabled(&PROFILE_TAG_STACK_BLOCK) {
            tracing::debug!(
                target: tags::PROFILE_BLOCK,
                op = "compress",
                block_id,
                uncompressed,
                compressed,
                elapsed_us,
                "block compressed"
            );
        }
        #[cfg(not(feature = "profiling"))]
        let _ = (block_id, uncompressed, compressed);
    }

    fn on_block_failed(&self, block_id: u64, elapsed: Duration) {
        telemetry::increment_counter(tags::METRIC_BLOCK_FAIL_COUNT, 1);
        telemetry::sub_gauge(tags::METRIC_BLOCK_PENDING, 1);
        tracing::debug!(
            target: tags::LOG_PARALLEL,
            block_id,
            elapsed_us = profile::duration_us(elapsed),
            "block task failed"
        );
    }

    fn on_block_flushed(&self, block_id: u64, compressed: usize) {
        telemetry::increment_counter(tags::METRIC_BLOCK_FLUSH_COUNT, 1);
        tracing::trace!(target: tags::LOG_PARALLEL, block_id, compressed, "block flushed to sink");
    }
}
