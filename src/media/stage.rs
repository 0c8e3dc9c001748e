//! The contract every pipeline stage shares: a bounded FIFO guarded by a
//! mutex and condition variable, and a dedicated worker thread that blocks
//! on the queue until input arrives or the stage shuts down.
//!
//! Queues cap at about one second of audio. Overflow drops the oldest
//! entry and warns once per burst; timestamps upstream come from synthetic
//! clocks, so dropping never corrupts timing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

/// Default queue depth: 50 packets ≈ 1 s of 20 ms audio.
pub const DEFAULT_QUEUE_DEPTH: usize = 50;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    /// In an overflow burst right now; cleared by the first push that fits.
    dropping: bool,
    dropped_in_burst: u64,
}

/// Bounded multi-producer single-consumer FIFO.
pub struct BoundedQueue<T> {
    label: String,
    cap: usize,
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(label: &str, cap: usize) -> Self {
        Self {
            label: label.to_string(),
            cap,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                dropping: false,
                dropped_in_burst: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Non-blocking push. On overflow the oldest entry is discarded so the
    /// newest input is never lost. Returns false when the queue is closed.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed {
            return false;
        }
        if inner.items.len() >= self.cap {
            inner.items.pop_front();
            if !inner.dropping {
                warn!(queue = %self.label, cap = self.cap, "queue overflow, dropping oldest");
                inner.dropping = true;
            }
            inner.dropped_in_burst += 1;
        } else if inner.dropping {
            debug!(
                queue = %self.label,
                dropped = inner.dropped_in_burst,
                "overflow burst ended"
            );
            inner.dropping = false;
            inner.dropped_in_burst = 0;
        }
        inner.items.push_back(item);
        drop(inner);
        self.cv.notify_one();
        true
    }

    /// Block until an item is available or the queue closes. `None` means
    /// closed; remaining buffered input is intentionally abandoned.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return None;
            }
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            self.cv.wait(&mut inner);
        }
    }

    /// Close and wake the worker. Idempotent; never blocks, so calling it
    /// with a non-empty queue cannot deadlock.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.cv.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run `work` on a dedicated thread for every queued item until the queue
/// closes. Stages call this lazily on first input.
pub fn spawn_worker<T: Send + 'static>(
    name: &str,
    queue: Arc<BoundedQueue<T>>,
    mut work: impl FnMut(T) + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(worker = %queue.label, "worker started");
            while let Some(item) = queue.pop() {
                work(item);
            }
            debug!(worker = %queue.label, "worker stopped");
        })
        .expect("spawn stage worker")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fifo_order_is_preserved() {
        let q = Arc::new(BoundedQueue::new("fifo", 100));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let worker = {
            let seen = seen.clone();
            spawn_worker("t", q.clone(), move |v: u32| seen.lock().push(v))
        };
        for i in 0..50 {
            assert!(q.push(i));
        }
        while q.len() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        q.close();
        worker.join().unwrap();
        let seen = seen.lock();
        assert_eq!(*seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn overflow_drops_oldest_and_keeps_newest() {
        let q: BoundedQueue<u32> = BoundedQueue::new("overflow", 3);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
    }

    #[test]
    fn close_wakes_blocked_worker() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new("close", 4));
        let popped = Arc::new(AtomicUsize::new(0));
        let worker = {
            let popped = popped.clone();
            spawn_worker("t", q.clone(), move |_| {
                popped.fetch_add(1, Ordering::SeqCst);
            })
        };
        // Worker is (or will be) blocked on an empty queue; closing must
        // end it promptly without any input.
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        worker.join().unwrap();
        assert_eq!(popped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let q: BoundedQueue<u32> = BoundedQueue::new("closed", 4);
        q.close();
        assert!(!q.push(1));
        assert_eq!(q.pop(), None);
    }
}
