use std::io;
use std::sync::Arc;
use std::thread;

use lzmt_core::{BufferPool, Lzma2Error};

#[test]
fn acquire_recycle_cycle_reuses_buffers() {
    let pool = BufferPool::new(2);
    assert_eq!(pool.max_buffers(), 2);
    assert_eq!(pool.limit_bytes(), usize::MAX);

    {
        let mut buffer = pool.acquire(64).unwrap();
        buffer.extend_from_slice(b"hello");
        assert_eq!(buffer.len(), 5);
    }

    let metrics = pool.metrics();
    assert_eq!(metrics.created, 1);
    assert_eq!(metrics.recycled, 0);
    assert_eq!(metrics.idle_buffers, 1);
    assert_eq!(metrics.live_bytes, 0);

    {
        let buffer = pool.acquire(32).unwrap();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.capacity() >= 64);
    }

    let metrics = pool.metrics();
    assert_eq!(metrics.created, 1);
    assert_eq!(metrics.recycled, 1);
    assert_eq!(metrics.dropped, 0);
}

#[test]
fn parked_buffer_that_is_too_small_is_replaced() {
    let pool = BufferPool::new(2);
    drop(pool.acquire(16).unwrap());

    let buffer = pool.acquire(1024).unwrap();
    assert!(buffer.capacity() >= 1024);
    assert_eq!(pool.metrics().created, 2);
    assert_eq!(pool.metrics().recycled, 0);
}

#[test]
fn full_pool_counts_dropped_buffer() {
    let pool = BufferPool::new(1);

    let first = pool.acquire(32).unwrap();
    let second = pool.acquire(32).unwrap();

    drop(first);
    drop(second);

    let metrics = pool.metrics();
    assert_eq!(metrics.created, 2);
    assert_eq!(metrics.dropped, 1);
}

#[test]
fn limit_rejects_requests_past_live_bytes() {
    let pool = BufferPool::with_limit(1000, 4);
    let held = pool.acquire(600).unwrap();
    assert_eq!(pool.metrics().live_bytes, 600);

    match pool.acquire(500) {
        Err(Lzma2Error::Capacity { requested, limit }) => {
            assert_eq!(requested, 500);
            assert_eq!(limit, 1000);
        }
        other => panic!("expected a capacity error, got {other:?}"),
    }

    drop(held);
    assert_eq!(pool.metrics().live_bytes, 0);
    assert!(pool.acquire(500).is_ok());
}

#[test]
fn purge_releases_parked_buffers() {
    let pool = BufferPool::new(4);
    let buffers: Vec<_> = (0..3).map(|_| pool.acquire(128).unwrap()).collect();
    drop(buffers);
    assert_eq!(pool.metrics().idle_buffers, 3);

    assert_eq!(pool.purge(), 3);
    assert_eq!(pool.metrics().idle_buffers, 0);
}

#[test]
fn acquire_is_thread_safe() -> Result<(), Box<dyn std::error::Error>> {
    let pool = Arc::new(BufferPool::with_limit(64 << 10, 8));
    let mut handles = Vec::new();

    for _ in 0..4 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || -> Result<(), Lzma2Error> {
            for _ in 0..500 {
                let mut buffer = pool.acquire(128)?;
                buffer.extend_from_slice(b"lzmt");
            }
            Ok(())
        }));
    }

    for handle in handles {
        handle
            .join()
            .map_err(|_| io::Error::other("worker thread panicked"))??;
    }

    let metrics = pool.metrics();
    assert!(metrics.created > 0);
    assert_eq!(metrics.live_bytes, 0);
    Ok(())
}
