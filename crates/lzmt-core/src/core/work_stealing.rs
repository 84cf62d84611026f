use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as DequeWorker};

use crate::sync::{lock_unpoisoned, wait_timeout_unpoisoned};

/// Job queue shared by the executor threads.
///
/// Submissions land in a global injector; each worker moves batches into its
/// own LIFO deque and steals from its siblings when both run dry.
pub struct WorkStealingQueue<T> {
    global: Injector<T>,
    local_workers: Vec<Mutex<Option<DequeWorker<T>>>>,
    stealers: Vec<Stealer<T>>,
    pending: AtomicUsize,
    closed: AtomicBool,
    wait_mutex: Mutex<()>,
    wait_condvar: Condvar,
}

impl<T> WorkStealingQueue<T> {
    pub fn new(num_workers: usize) -> Self {
        let worker_count = num_workers.max(1);
        let (local_workers, stealers) = (0..worker_count)
            .map(|_| {
                let worker = DequeWorker::new_lifo();
                let stealer = worker.stealer();
                (Mutex::new(Some(worker)), stealer)
            })
            .unzip();

        Self {
            global: Injector::new(),
            local_workers,
            stealers,
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            wait_mutex: Mutex::new(()),
            wait_condvar: Condvar::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.stealers.len()
    }

    /// Approximate number of queued jobs across all deques.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    pub fn submit(&self, item: T) {
        self.global.push(item);
        self.pending.fetch_add(1, Ordering::AcqRel);
        let _guard = lock_unpoisoned(&self.wait_mutex);
        self.wait_condvar.notify_one();
    }

    /// Marks the queue closed and wakes every waiting worker.
    ///
    /// Jobs already queued can still be taken; closing only tells idle
    /// workers that no more will arrive.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = lock_unpoisoned(&self.wait_mutex);
        self.wait_condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Blocks until a job is queued, the queue is closed, or `timeout` passes.
    pub fn wait_for_work(&self, timeout: Duration) {
        let guard = lock_unpoisoned(&self.wait_mutex);
        if self.pending() > 0 || self.is_closed() {
            return;
        }
        let _ = wait_timeout_unpoisoned(&self.wait_condvar, guard, timeout);
    }

    /// Hands out the worker side for `id`; each id can be taken once.
    pub fn worker(self: &Arc<Self>, id: usize) -> Option<WorkStealingWorker<T>> {
        let local = lock_unpoisoned(self.local_workers.get(id)?).take()?;
        Some(WorkStealingWorker {
            id,
            local,
            queue: Arc::clone(self),
        })
    }

    fn decrement_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }
}

/// The per-thread end of a [`WorkStealingQueue`].
pub struct WorkStealingWorker<T> {
    id: usize,
    local: DequeWorker<T>,
    queue: Arc<WorkStealingQueue<T>>,
}

impl<T> WorkStealingWorker<T> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Approximate queue depth visible to this worker.
    pub fn queue_depth(&self) -> usize {
        self.local.len().saturating_add(self.queue.global.len())
    }

    /// Takes one job: local deque first, then the injector, then siblings.
    pub fn steal(&self) -> Option<T> {
        let item = self
            .local
            .pop()
            .or_else(|| self.retry_steal(|| self.queue.global.steal_batch_and_pop(&self.local)))
            .or_else(|| self.steal_from_others())?;
        self.queue.decrement_pending();
        Some(item)
    }

    pub fn wait_for_work(&self, timeout: Duration) {
        self.queue.wait_for_work(timeout);
    }

    /// True once the queue is closed and nothing is left to take.
    pub fn is_drained(&self) -> bool {
        self.queue.is_closed() && self.queue.is_empty()
    }

    fn steal_from_others(&self) -> Option<T> {
        let len = self.queue.stealers.len();
        (1..len)
            .map(|offset| (self.id + offset) % len)
            .find_map(|idx| {
                self.retry_steal(|| self.queue.stealers[idx].steal_batch_and_pop(&self.local))
            })
    }

    fn retry_steal<F>(&self, mut op: F) -> Option<T>
    where
        F: FnMut() -> Steal<T>,
    {
        loop {
            match op() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }
}
