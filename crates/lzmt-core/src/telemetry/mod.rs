//! Process-wide metrics for chunks, blocks, buffers and executor workers.
//!
//! Recording is a no-op unless the `telemetry` feature is on. [`snapshot`]
//! reads everything back; the typed views on [`TelemetrySnapshot`] are what
//! callers normally want.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod profile;
pub mod tags;
pub mod worker;

pub use worker::{BlockTelemetry, DefaultBlockTelemetry, DefaultWorkerTelemetry, WorkerTelemetry};

/// Summary of one latency histogram, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub total: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
}

/// Everything recorded so far, keyed by the names in [`tags`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

/// Chunks framed by every writer in the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTotals {
    pub lzma_chunks: u64,
    pub raw_chunks: u64,
    pub uncompressed_bytes: u64,
    /// Framed bytes, headers included.
    pub compressed_bytes: u64,
}

/// Parallel block lifecycle counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockTotals {
    pub submitted: u64,
    pub finished: u64,
    pub failed: u64,
    pub flushed: u64,
    /// Blocks started but neither finished nor failed.
    pub in_flight: u64,
    pub latency_us: Option<HistogramSnapshot>,
    /// Time writers spent waiting for a task slot.
    pub slot_wait_us: Option<HistogramSnapshot>,
}

/// Buffer pool traffic across every pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferTotals {
    pub created: u64,
    pub recycled: u64,
    pub rejected: u64,
    /// Buffers released while their pool was full.
    pub dropped: u64,
    pub live_bytes: u64,
}

impl TelemetrySnapshot {
    pub fn chunks(&self) -> ChunkTotals {
        ChunkTotals {
            lzma_chunks: self.counter(tags::METRIC_CHUNK_LZMA_COUNT),
            raw_chunks: self.counter(tags::METRIC_CHUNK_RAW_COUNT),
            uncompressed_bytes: self.counter(tags::METRIC_CHUNK_UNCOMPRESSED_BYTES),
            compressed_bytes: self.counter(tags::METRIC_CHUNK_COMPRESSED_BYTES),
        }
    }

    pub fn blocks(&self) -> BlockTotals {
        BlockTotals {
            submitted: self.counter(tags::METRIC_BLOCK_SUBMIT_COUNT),
            finished: self.counter(tags::METRIC_BLOCK_FINISH_COUNT),
            failed: self.counter(tags::METRIC_BLOCK_FAIL_COUNT),
            flushed: self.counter(tags::METRIC_BLOCK_FLUSH_COUNT),
            in_flight: self.gauge(tags::METRIC_BLOCK_PENDING),
            latency_us: self.histograms.get(tags::METRIC_BLOCK_LATENCY_US).copied(),
            slot_wait_us: self.histograms.get(tags::METRIC_BLOCK_SUBMIT_WAIT_US).copied(),
        }
    }

    pub fn buffers(&self) -> BufferTotals {
        BufferTotals {
            created: self.counter(tags::METRIC_BUFFER_ACQUIRE_CREATED_COUNT),
            recycled: self.counter(tags::METRIC_BUFFER_ACQUIRE_RECYCLED_COUNT),
            rejected: self.counter(tags::METRIC_BUFFER_ACQUIRE_REJECTED_COUNT),
            dropped: self.counter(tags::METRIC_BUFFER_RECYCLE_DROPPED_COUNT),
            live_bytes: self.gauge(tags::METRIC_BUFFER_LIVE_BYTES),
        }
    }

    fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    fn gauge(&self, name: &str) -> u64 {
        self.gauges.get(name).copied().unwrap_or(0)
    }
}

#[inline]
pub fn increment_counter(name: &'static str, value: u64) {
    #[cfg(feature = "telemetry")]
    registry::increment_counter(name, value);

    let _ = (name, value);
}

#[inline]
pub fn record_histogram(name: &'static str, value: u64) {
    #[cfg(feature = "telemetry")]
    registry::record_histogram(name, value);

    let _ = (name, value);
}

#[inline]
pub fn record_duration_us(name: &'static str, elapsed: Duration) {
    record_histogram(name, profile::duration_us(elapsed));
}

#[inline]
pub fn set_gauge(name: &'static str, value: u64) {
    #[cfg(feature = "telemetry")]
    registry::set_gauge(name, value);

    let _ = (name, value);
}

#[inline]
pub fn add_gauge(name: &'static str, delta: u64) {
    #[cfg(feature = "telemetry")]
    registry::add_gauge(name, delta);

    let _ = (name, delta);
}

/// Subtracts `delta` from a gauge, stopping at zero.
#[inline]
pub fn sub_gauge(name: &'static str, delta: u64) {
    #[cfg(feature = "telemetry")]
    registry::sub_gauge(name, delta);

    let _ = (name, delta);
}

/// Counts one framed chunk.
pub(crate) fn record_chunk(lzma: bool, uncompressed: usize, framed: usize) {
    let count = if lzma {
        tags::METRIC_CHUNK_LZMA_COUNT
    } else {
        tags::METRIC_CHUNK_RAW_COUNT
    };
    increment_counter(count, 1);
    increment_counter(tags::METRIC_CHUNK_UNCOMPRESSED_BYTES, uncompressed as u64);
    increment_counter(tags::METRIC_CHUNK_COMPRESSED_BYTES, framed as u64);
}

pub fn snapshot() -> TelemetrySnapshot {
    #[cfg(feature = "telemetry")]
    {
        registry::snapshot()
    }

    #[cfg(not(feature = "telemetry"))]
    {
        TelemetrySnapshot::default()
    }
}

#[cfg(feature = "telemetry")]
mod registry {
    use std::collections::BTreeMap;
    use std::sync::{Mutex, OnceLock};

    use super::{HistogramSnapshot, TelemetrySnapshot};
    use crate::sync::lock_unpoisoned;

    #[derive(Debug, Clone, Copy, Default)]
    struct Aggregate {
        count: u64,
        total: u64,
        min: u64,
        max: u64,
    }

    impl Aggregate {
        fn record(&mut self, value: u64) {
            if self.count == 0 {
                self.min = value;
                self.max = value;
            } else {
                self.min = self.min.min(value);
                self.max = self.max.max(value);
            }
            self.count = self.count.saturating_add(1);
            self.total = self.total.saturating_add(value);
        }

        fn summary(&self) -> HistogramSnapshot {
            HistogramSnapshot {
                count: self.count,
                total: self.total,
                min: self.min,
                max: self.max,
                mean: match self.count {
                    0 => 0.0,
                    count => self.total as f64 / count as f64,
                },
            }
        }
    }

    /// Writers touch one map per call, so each map has its own lock.
    #[derive(Default)]
    struct Registry {
        counters: Mutex<BTreeMap<&'static str, u64>>,
        gauges: Mutex<BTreeMap<&'static str, u64>>,
        histograms: Mutex<BTreeMap<&'static str, Aggregate>>,
    }

    fn registry() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::default)
    }

    fn update(map: &Mutex<BTreeMap<&'static str, u64>>, name: &'static str, f: impl FnOnce(u64) -> u64) {
        let mut map = lock_unpoisoned(map);
        let entry = map.entry(name).or_insert(0);
        *entry = f(*entry);
    }

    pub(super) fn increment_counter(name: &'static str, value: u64) {
        update(&registry().counters, name, |current| current.saturating_add(value));
    }

    pub(super) fn set_gauge(name: &'static str, value: u64) {
        update(&registry().gauges, name, |_| value);
    }

    pub(super) fn add_gauge(name: &'static str, delta: u64) {
        update(&registry().gauges, name, |current| current.saturating_add(delta));
    }

    pub(super) fn sub_gauge(name: &'static str, delta: u64) {
        update(&registry().gauges, name, |current| current.saturating_sub(delta));
    }

    pub(super) fn record_histogram(name: &'static str, value: u64) {
        lock_unpoisoned(&registry().histograms)
            .entry(name)
            .or_default()
            .record(value);
    }

    pub(super) fn snapshot() -> TelemetrySnapshot {
        let registry = registry();
        let owned = |map: &BTreeMap<&'static str, u64>| -> BTreeMap<String, u64> {
            map.iter()
                .map(|(name, value)| ((*name).to_owned(), *value))
                .collect()
        };
        TelemetrySnapshot {
            counters: owned(&lock_unpoisoned(&registry.counters)),
            gauges: owned(&lock_unpoisoned(&registry.gauges)),
            histograms: lock_unpoisoned(&registry.histograms)
                .iter()
                .map(|(name, aggregate)| ((*name).to_owned(), aggregate.summary()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_views_default_missing_metrics_to_zero() {
        let mut snapshot = TelemetrySnapshot::default();
        snapshot
            .counters
            .insert(tags::METRIC_CHUNK_RAW_COUNT.to_owned(), 3);
        snapshot
            .gauges
            .insert(tags::METRIC_BUFFER_LIVE_BYTES.to_owned(), 4096);

        assert_eq!(
            snapshot.chunks(),
            ChunkTotals {
                raw_chunks: 3,
                ..ChunkTotals::default()
            }
        );
        assert_eq!(snapshot.buffers().live_bytes, 4096);
        assert_eq!(snapshot.blocks(), BlockTotals::default());
    }
}
