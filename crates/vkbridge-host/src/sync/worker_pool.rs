use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::error;

struct PoolQueue<T> {
    /// `(target worker, item)`; untargeted items go to whichever worker is free.
    items: VecDeque<(Option<usize>, T)>,
    done: bool,
}

struct PoolShared<T> {
    queue: Mutex<PoolQueue<T>>,
    available: Condvar,
}

/// Fixed-size pool of threads draining one FIFO queue.
///
/// Items can be pinned to a specific worker, which is how per-thread setup and teardown
/// commands reach every worker exactly once. After [`WorkerPool::done`], workers finish every
/// queued item that is theirs to take and then exit.
pub struct WorkerPool<T> {
    shared: Arc<PoolShared<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn start<F>(name: &str, size: usize, handler: F) -> io::Result<Self>
    where
        F: Fn(usize, T) + Send + Sync + 'static,
    {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                items: VecDeque::new(),
                done: false,
            }),
            available: Condvar::new(),
        });
        let handler = Arc::new(handler);

        let mut threads = Vec::with_capacity(size);
        for worker in 0..size {
            let worker_shared = Arc::clone(&shared);
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn(move || Self::worker_loop(worker, &worker_shared, handler.as_ref()));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    // Tear down whatever already started before reporting.
                    shared.queue.lock().done = true;
                    shared.available.notify_all();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }
        }

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            size,
        })
    }

    fn worker_loop(worker: usize, shared: &PoolShared<T>, handler: &(dyn Fn(usize, T) + Send + Sync)) {
        let mut queue = shared.queue.lock();
        loop {
            let pos = queue
                .items
                .iter()
                .position(|(target, _)| target.map_or(true, |t| t == worker));
            let next = pos.and_then(|pos| queue.items.remove(pos));
            if let Some((_, item)) = next {
                drop(queue);
                handler(worker, item);
                queue = shared.queue.lock();
                continue;
            }
            if queue.done {
                return;
            }
            shared.available.wait(&mut queue);
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue an item for any worker. Returns `false` once the pool is done.
    pub fn enqueue(&self, item: T) -> bool {
        self.push(None, item)
    }

    /// Queue an item that only `worker` may take.
    pub fn enqueue_to(&self, worker: usize, item: T) -> bool {
        self.push(Some(worker % self.size), item)
    }

    /// Queue `make(i)` for every worker `i`.
    pub fn broadcast_indexed(&self, make: impl Fn(usize) -> T) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.done {
            return false;
        }
        for worker in 0..self.size {
            queue.items.push_back((Some(worker), make(worker)));
        }
        drop(queue);
        self.shared.available.notify_all();
        true
    }

    fn push(&self, target: Option<usize>, item: T) -> bool {
        let mut queue = self.shared.queue.lock();
        if queue.done {
            return false;
        }
        queue.items.push_back((target, item));
        drop(queue);
        // A targeted item must reach its worker, so wake everyone.
        if target.is_some() {
            self.shared.available.notify_all();
        } else {
            self.shared.available.notify_one();
        }
        true
    }

    /// Stop accepting items; workers exit once their share of the queue is drained.
    pub fn done(&self) {
        self.shared.queue.lock().done = true;
        self.shared.available.notify_all();
    }

    pub fn join(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                error!("sync worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_item_runs_before_join_returns() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let pool = WorkerPool::start("test-pool", 3, move |_, n: usize| {
            counter.fetch_add(n, Ordering::SeqCst);
        })
        .unwrap();
        for _ in 0..100 {
            assert!(pool.enqueue(1));
        }
        pool.done();
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 100);
        assert!(!pool.enqueue(1));
    }

    #[test]
    fn broadcast_reaches_each_worker_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let pool = WorkerPool::start("test-bcast", 4, move |worker, tag: usize| {
            assert_eq!(worker, tag);
            seen2.lock().push(worker);
        })
        .unwrap();
        assert!(pool.broadcast_indexed(|i| i));
        pool.done();
        pool.join();
        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
