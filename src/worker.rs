//! Fixed pool of worker threads that dequeue ready sessions from the
//! `Poller` and advance them (spec.md §4.6). The teacher spawns one tokio
//! task per listener instead of a fixed thread pool, so this is this core's
//! own condvar/`Mutex`-guarded FIFO over raw OS threads, built for a core
//! with no async runtime rather than adapted from the teacher's task model.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::poller::Poller;
use crate::session::{AdvanceOutcome, Session};

/// One ready notification, enqueued by the poller thread and dequeued by a
/// worker (spec.md §4.3's `WorkItem`).
pub struct WorkItem {
    pub session: Arc<Session>,
}

struct Queue {
    items: Mutex<VecDeque<WorkItem>>,
    not_empty: Condvar,
    stopped: Mutex<bool>,
}

impl Queue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            stopped: Mutex::new(false),
        }
    }

    fn push(&self, item: WorkItem) {
        self.items.lock().unwrap().push_back(item);
        self.not_empty.notify_one();
    }

    /// Blocks until an item is available or the queue is stopped, in which
    /// case `None` is returned once the queue has drained.
    fn pop(&self) -> Option<WorkItem> {
        let mut items = self.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if *self.stopped.lock().unwrap() {
                return None;
            }
            items = self.not_empty.wait(items).unwrap();
        }
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.not_empty.notify_all();
    }
}

/// Called once a session's `advance` reports `Closed`, so the owner can
/// unregister the fd and drop its last reference.
pub type OnClosed = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

/// `WorkerPool::start(n)` per spec.md §4.6. `n == 1` bypasses the queue
/// entirely: `submit` advances the session inline on the caller's thread
/// (the poller thread), matching the spec's explicit single-worker carve-out.
pub struct WorkerPool {
    queue: Option<Arc<Queue>>,
    poller: Arc<Poller>,
    on_closed: OnClosed,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(n: usize, poller: Arc<Poller>, on_closed: OnClosed) -> Self {
        assert!(n >= 1, "worker pool must have at least one worker");

        if n == 1 {
            return Self { queue: None, poller, on_closed, handles: Mutex::new(Vec::new()) };
        }

        let queue = Arc::new(Queue::new());
        let handles = (0..n)
            .map(|idx| {
                let queue = queue.clone();
                let poller = poller.clone();
                let on_closed = on_closed.clone();
                thread::Builder::new()
                    .name(format!("syslog-ingest-worker-{idx}"))
                    .spawn(move || worker_loop(&queue, &poller, &on_closed))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(workers = n, "worker pool started");
        Self { queue: Some(queue), poller, on_closed, handles: Mutex::new(handles) }
    }

    /// Hand a ready session to the pool. With `n == 1` this advances the
    /// session synchronously; otherwise it enqueues for a worker thread.
    pub fn submit(&self, session: Arc<Session>) {
        match &self.queue {
            Some(queue) => queue.push(WorkItem { session }),
            None => {
                if session.advance(&self.poller) == AdvanceOutcome::Closed {
                    (self.on_closed)(&session);
                }
            }
        }
    }

    /// Set the stop flag and wake every worker; they drain the queue and
    /// exit (spec.md §4.6, §5 — cooperative cancellation, no forced kill).
    /// Takes `&self` so the pool can be shared (via `Arc`) with the poller
    /// thread that feeds it while still being joinable from the owner.
    pub fn stop_and_join(&self) {
        if let Some(queue) = &self.queue {
            queue.stop();
        }
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.join() {
                error!(error = ?e, "worker thread panicked");
            }
        }
    }
}

fn worker_loop(queue: &Queue, poller: &Poller, on_closed: &OnClosed) {
    while let Some(item) = queue.pop() {
        // `advance` itself uses `try_lock` and simply returns if another
        // worker already holds the session (spec.md §4.4, §4.6 step 2) —
        // the lock holder is responsible for rearming on exit.
        if item.session.advance(poller) == AdvanceOutcome::Closed {
            on_closed(&item.session);
        }
    }
}
