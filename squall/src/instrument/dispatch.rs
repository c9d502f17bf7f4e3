// The compile job dispatcher
//
// A small shared worker pool for instrumentation work. Jobs are
// grouped into buckets; when a bucket's last job retires its
// completion hook runs, which is how the controller chains its
// shaders -> pipelines -> commit phases without any phase-level
// barrier thread.
//
// Austin Shafer - 2025

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

/// Tracks a group of jobs and fires a hook when the last one lands
pub struct DispatcherBucket {
    db_outstanding: AtomicUsize,
    db_on_done: Mutex<Option<Job>>,
}

impl DispatcherBucket {
    /// Create a bucket with its completion hook
    ///
    /// The bucket starts with one phantom job held, release() arms
    /// it. Without that a bucket whose jobs all finish while more are
    /// still being enqueued would fire early.
    pub fn new(on_done: Job) -> Arc<Self> {
        Arc::new(Self {
            db_outstanding: AtomicUsize::new(1),
            db_on_done: Mutex::new(Some(on_done)),
        })
    }

    fn begin(&self) {
        self.db_outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn end(&self) {
        if self.db_outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(hook) = self.db_on_done.lock().unwrap().take() {
                hook();
            }
        }
    }

    /// Drop the phantom hold; the hook can fire from here on
    pub fn release(self: &Arc<Self>) {
        self.end();
    }
}

struct DispatchQueue {
    dq_jobs: VecDeque<Job>,
    dq_exit: bool,
}

struct DispatchShared {
    ds_queue: Mutex<DispatchQueue>,
    ds_wake: Condvar,
}

/// Shared worker thread pool for compile jobs
pub struct Dispatcher {
    d_shared: Arc<DispatchShared>,
    d_threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(worker_count: usize) -> Self {
        let shared = Arc::new(DispatchShared {
            ds_queue: Mutex::new(DispatchQueue {
                dq_jobs: VecDeque::new(),
                dq_exit: false,
            }),
            ds_wake: Condvar::new(),
        });

        let mut threads = Vec::new();
        for i in 0..worker_count.max(1) {
            let worker_shared = shared.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("squall-compile-{}", i))
                    .spawn(move || Self::worker_entry(worker_shared))
                    .expect("Could not spawn compile worker"),
            );
        }

        Self {
            d_shared: shared,
            d_threads: Mutex::new(threads),
        }
    }

    fn worker_entry(shared: Arc<DispatchShared>) {
        let mut queue = shared.ds_queue.lock().unwrap();
        loop {
            if let Some(job) = queue.dq_jobs.pop_front() {
                drop(queue);
                job();
                queue = shared.ds_queue.lock().unwrap();
                continue;
            }

            if queue.dq_exit {
                return;
            }
            queue = shared.ds_wake.wait(queue).unwrap();
        }
    }

    /// Enqueue one job into a bucket
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, bucket: &Arc<DispatcherBucket>, job: F) {
        bucket.begin();
        let job_bucket = bucket.clone();
        let wrapped: Job = Box::new(move || {
            job();
            job_bucket.end();
        });

        let mut queue = self.d_shared.ds_queue.lock().unwrap();
        queue.dq_jobs.push_back(wrapped);
        self.d_shared.ds_wake.notify_one();
    }

    /// Abandon queued work and join the workers
    ///
    /// Running jobs finish, queued jobs are dropped on the floor, and
    /// with them their bucket holds; dropped hooks simply never fire,
    /// which matches the no-cancellation contract: shutdown is the
    /// only way work disappears.
    pub fn shutdown(&self) {
        {
            let mut queue = self.d_shared.ds_queue.lock().unwrap();
            queue.dq_exit = true;
            queue.dq_jobs.clear();
            self.d_shared.ds_wake.notify_all();
        }

        let mut threads = self.d_threads.lock().unwrap();
        for handle in threads.drain(..) {
            handle.join().ok();
        }
    }
}
