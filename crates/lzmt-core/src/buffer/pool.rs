use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};

use crate::telemetry;
use crate::telemetry::profile;
use crate::telemetry::tags;
use crate::{Lzma2Error, Result};

const PROFILE_TAG_STACK_BUFFER: [&str; 2] = [tags::TAG_SYSTEM, tags::TAG_BUFFER];

/// A pool of reusable byte buffers with an optional ceiling on live bytes.
///
/// Block tasks, stream accumulation buffers and encoder windows all come from
/// here. A buffer is "live" from `acquire` until its [`PooledBuffer`] drops;
/// recycled buffers parked in the pool do not count against the limit.
///
/// # Example
/// ```
/// use lzmt_core::BufferPool;
///
/// let pool = BufferPool::with_limit(1 << 20, 8);
/// let buffer = pool.acquire(4096).expect("within limit");
/// assert!(buffer.capacity() >= 4096);
/// drop(buffer); // returns to pool automatically
/// ```
#[derive(Debug)]
pub struct BufferPool {
    recycler: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
    limit_bytes: usize,
    max_buffers: usize,
    metrics: Arc<PoolMetricsInner>,
}

impl BufferPool {
    /// Creates a pool without a byte limit that parks up to `max_buffers` idle buffers.
    pub fn new(max_buffers: usize) -> Self {
        Self::with_limit(usize::MAX, max_buffers)
    }

    /// Creates a pool that refuses to hand out more than `limit_bytes` at once.
    ///
    /// # Arguments
    /// * `limit_bytes` - Ceiling on the total capacity of live buffers
    /// * `max_buffers` - Maximum number of idle buffers to keep for reuse
    pub fn with_limit(limit_bytes: usize, max_buffers: usize) -> Self {
        let (tx, rx) = bounded(max_buffers.max(1));
        Self {
            recycler: tx,
            receiver: rx,
            limit_bytes,
            max_buffers: max_buffers.max(1),
            metrics: Arc::new(PoolMetricsInner::default()),
        }
    }

    /// Acquires a zero-length buffer with at least `size` bytes of capacity.
    ///
    /// A parked buffer is reused when it is large enough; a parked buffer that
    /// is too small is released and a fresh one is allocated instead.
    ///
    /// # Errors
    /// Returns [`Lzma2Error::Capacity`] when the request would push live bytes
    /// past the configured limit.
    pub fn acquire(&self, size: usize) -> Result<PooledBuffer> {
        let started_at = Instant::now();
        let parked = match self.receiver.try_recv() {
            Ok(buffer) if buffer.capacity() >= size => Some(buffer),
            Ok(_) | Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        };

        // A parked buffer may be much larger than the request; when its full
        // capacity does not fit under the limit, fall back to a right-sized one.
        let (result, buffer, reserved) = match parked {
            Some(mut buffer) if self.reserve(buffer.capacity()).is_ok() => {
                buffer.clear();
                self.metrics.recycled.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(tags::METRIC_BUFFER_ACQUIRE_RECYCLED_COUNT, 1);
                let capacity = buffer.capacity();
                ("recycled", buffer, capacity)
            }
            _ => {
                if let Err(err) = self.reserve(size) {
                    telemetry::increment_counter(tags::METRIC_BUFFER_ACQUIRE_REJECTED_COUNT, 1);
                    tracing::debug!(
                        target: tags::PROFILE_BUFFER,
                        requested = size,
                        limit = self.limit_bytes,
                        "buffer acquire rejected"
                    );
                    return Err(err);
                }
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                telemetry::increment_counter(tags::METRIC_BUFFER_ACQUIRE_CREATED_COUNT, 1);
                ("created", Vec::with_capacity(size), size)
            }
        };

        let elapsed_us = profile::elapsed_us(started_at);
        telemetry::record_histogram(tags::METRIC_BUFFER_ACQUIRE_LATENCY_US, elapsed_us);
        profile::event(
            tags::PROFILE_BUFFER,
            &PROFILE_TAG_STACK_BUFFER,
            "acquire",
            result,
            elapsed_us,
            "buffer acquire completed",
        );

        Ok(PooledBuffer::new(
            buffer,
            reserved,
            self.recycler.clone(),
            Arc::clone(&self.metrics),
        ))
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        let mut current = self.metrics.live_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > self.limit_bytes {
                return Err(Lzma2Error::Capacity {
                    requested: bytes,
                    limit: self.limit_bytes,
                });
            }
            match self.metrics.live_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        telemetry::add_gauge(tags::METRIC_BUFFER_LIVE_BYTES, bytes as u64);
        Ok(())
    }

    /// Drops every parked buffer, returning the pool to a cold state.
    pub fn purge(&self) -> usize {
        let mut released = 0;
        while self.receiver.try_recv().is_ok() {
            released += 1;
        }
        released
    }

    /// Returns a snapshot of the current pool metrics.
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            created: self.metrics.created.load(Ordering::Relaxed),
            recycled: self.metrics.recycled.load(Ordering::Relaxed),
            dropped: self.metrics.dropped.load(Ordering::Relaxed),
            live_bytes: self.metrics.live_bytes.load(Ordering::Acquire),
            idle_buffers: self.receiver.len(),
        }
    }

    /// Returns the ceiling on live bytes (`usize::MAX` when unbounded).
    pub fn limit_bytes(&self) -> usize {
        self.limit_bytes
    }

    /// Returns the maximum number of idle buffers the pool can hold.
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }
}

/// A snapshot of buffer pool metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolMetricsSnapshot {
    /// Number of buffers allocated by the pool
    pub created: usize,
    /// Number of acquisitions served from a parked buffer
    pub recycled: usize,
    /// Number of buffers freed instead of parked (pool full)
    pub dropped: usize,
    /// Capacity currently checked out
    pub live_bytes: usize,
    /// Buffers currently parked for reuse
    pub idle_buffers: usize,
}

#[derive(Debug, Default)]
struct PoolMetricsInner {
    created: AtomicUsize,
    recycled: AtomicUsize,
    dropped: AtomicUsize,
    live_bytes: AtomicUsize,
}

/// A buffer allocated from a [`BufferPool`].
///
/// When dropped, this buffer is automatically returned to the pool
/// for reuse and its reservation is released. Implements `Deref` and
/// `DerefMut` for transparent access to the underlying `Vec<u8>`.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Vec<u8>,
    reserved: usize,
    recycler: Sender<Vec<u8>>,
    metrics: Arc<PoolMetricsInner>,
}

impl PooledBuffer {
    fn new(
        buffer: Vec<u8>,
        reserved: usize,
        recycler: Sender<Vec<u8>>,
        metrics: Arc<PoolMetricsInner>,
    ) -> Self {
        Self {
            buffer,
            reserved,
            recycler,
            metrics,
        }
    }

    /// Returns a slice reference to the buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Returns a mutable reference to the underlying Vec.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.metrics
            .live_bytes
            .fetch_sub(self.reserved, Ordering::AcqRel);
        telemetry::sub_gauge(tags::METRIC_BUFFER_LIVE_BYTES, self.reserved as u64);

        if let Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) =
            self.recycler.try_send(buffer)
        {
            self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
            telemetry::increment_counter(tags::METRIC_BUFFER_RECYCLE_DROPPED_COUNT, 1);
            profile::event(
                tags::PROFILE_BUFFER,
                &PROFILE_TAG_STACK_BUFFER,
                "recycle",
                "dropped",
                0,
                "buffer dropped instead of recycled",
            );
        } else {
            telemetry::increment_counter(tags::METRIC_BUFFER_RECYCLE_OK_COUNT, 1);
            profile::event(
                tags::PROFILE_BUFFER,
                &PROFILE_TAG_STACK_BUFFER,
                "recycle",
                "recycled",
                0,
                "buffer recycled to pool",
            );
        }
    }
}
