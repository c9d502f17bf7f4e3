// The message drain worker
//
// A single background thread that consumes filled mirror streams and
// hands their messages to the feature handlers. Producers park
// mirrors here from the pool's reap path; the worker owns turning
// raw GPU records into report entries off the application's threads.
//
// Back-pressure is age based rather than length based: every push
// bumps an age counter on the entries already queued, and once
// anything has sat past the throttle threshold the producer kicks the
// worker and blocks on the done condvar until the queue runs dry.
//
// Austin Shafer - 2025

use crate::features::FeatureRegistry;
use crate::heap::HeapPool;
use crate::messages::{GpuMessage, StreamHeader, STREAM_HEADER_SIZE};
use crate::report::Report;

extern crate utils as sq_utils;
use sq_utils::log;

use super::MirrorAllocation;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Entries older than this many pushes force a synchronous drain
const THROTTLE_THRESHOLD: u32 = 64;

/// One filled mirror awaiting the worker
pub(crate) struct PendingMirror {
    pub pm_mirror: MirrorAllocation,
    /// Messages the filter pre-pass deemed visible
    pub pm_visible: u32,
    /// Bumped once per push while this entry waits
    pub pm_age: u32,
}

struct DrainQueue {
    dq_entries: VecDeque<PendingMirror>,
    /// The worker is mid-entry, the queue being empty does not mean
    /// we are idle
    dq_busy: bool,
    dq_exit: bool,
    /// Analyzer pause: streams still drain and recycle, handlers are
    /// skipped
    dq_paused: bool,
    /// Mirrors the worker has finished with, reclaimed by the pool
    dq_recycled: Vec<MirrorAllocation>,
}

pub(crate) struct DrainShared {
    ds_queue: Mutex<DrainQueue>,
    ds_wake: Condvar,
    ds_done: Condvar,
}

/// The single drain worker thread and its queue
pub struct DrainWorker {
    dw_shared: Arc<DrainShared>,
    dw_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DrainWorker {
    pub(crate) fn new(
        heaps: Arc<HeapPool>,
        features: Arc<FeatureRegistry>,
        report: Arc<Mutex<Report>>,
    ) -> Self {
        let shared = Arc::new(DrainShared {
            ds_queue: Mutex::new(DrainQueue {
                dq_entries: VecDeque::new(),
                dq_busy: false,
                dq_exit: false,
                dq_paused: false,
                dq_recycled: Vec::new(),
            }),
            ds_wake: Condvar::new(),
            ds_done: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("squall-drain".to_string())
            .spawn(move || {
                Self::worker_entry(thread_shared, heaps, features, report);
            })
            .expect("Could not spawn the drain worker");

        Self {
            dw_shared: shared,
            dw_thread: Mutex::new(Some(handle)),
        }
    }

    /// Park a filled mirror for the worker
    ///
    /// Blocks when something queued has aged past the throttle
    /// threshold, which is what keeps a runaway producer from growing
    /// the queue without bound.
    pub(crate) fn push(&self, mirror: MirrorAllocation, visible: u32) {
        let mut queue = self.dw_shared.ds_queue.lock().unwrap();

        let mut throttle = false;
        for entry in queue.dq_entries.iter_mut() {
            entry.pm_age += 1;
            if entry.pm_age >= THROTTLE_THRESHOLD {
                throttle = true;
            }
        }

        queue.dq_entries.push_back(PendingMirror {
            pm_mirror: mirror,
            pm_visible: visible,
            pm_age: 0,
        });
        self.dw_shared.ds_wake.notify_one();

        if throttle {
            log::debug!("drain queue aged past threshold, throttling producer");
            while !(queue.dq_entries.is_empty() && !queue.dq_busy) && !queue.dq_exit {
                queue = self.dw_shared.ds_done.wait(queue).unwrap();
            }
        }
    }

    /// Block until everything queued so far has been handled
    ///
    /// This is the explicit-sync flush: fence waits and device idle
    /// route through here so reports are complete before the
    /// application observes the sync.
    pub fn wait_idle(&self) {
        let mut queue = self.dw_shared.ds_queue.lock().unwrap();
        while !(queue.dq_entries.is_empty() && !queue.dq_busy) && !queue.dq_exit {
            queue = self.dw_shared.ds_done.wait(queue).unwrap();
        }
    }

    /// Gate or ungate message transformation
    pub fn set_paused(&self, paused: bool) {
        self.dw_shared.ds_queue.lock().unwrap().dq_paused = paused;
    }

    /// Reclaim mirrors the worker is done with
    pub(crate) fn take_recycled(&self) -> Vec<MirrorAllocation> {
        let mut queue = self.dw_shared.ds_queue.lock().unwrap();
        std::mem::take(&mut queue.dq_recycled)
    }

    /// Flag the worker down and join it
    pub fn shutdown(&self) {
        {
            let mut queue = self.dw_shared.ds_queue.lock().unwrap();
            queue.dq_exit = true;
            self.dw_shared.ds_wake.notify_all();
            self.dw_shared.ds_done.notify_all();
        }

        if let Some(handle) = self.dw_thread.lock().unwrap().take() {
            handle.join().ok();
        }
    }

    fn worker_entry(
        shared: Arc<DrainShared>,
        heaps: Arc<HeapPool>,
        features: Arc<FeatureRegistry>,
        report: Arc<Mutex<Report>>,
    ) {
        let mut queue = shared.ds_queue.lock().unwrap();

        loop {
            // Drain whatever is queued before checking for exit, a
            // shutdown should not lose messages
            while let Some(entry) = queue.dq_entries.pop_front() {
                queue.dq_busy = true;
                let paused = queue.dq_paused;
                drop(queue);

                if !paused {
                    Self::process_mirror(&heaps, &features, &report, &entry);
                }

                queue = shared.ds_queue.lock().unwrap();
                queue.dq_busy = false;
                queue.dq_recycled.push(entry.pm_mirror);
            }

            shared.ds_done.notify_all();

            if queue.dq_exit {
                return;
            }
            queue = shared.ds_wake.wait(queue).unwrap();
        }
    }

    /// Hand one mirror's header and message array to the handlers
    fn process_mirror(
        heaps: &HeapPool,
        features: &FeatureRegistry,
        report: &Mutex<Report>,
        entry: &PendingMirror,
    ) {
        let base = heaps.mapped_ptr(&entry.pm_mirror.ma_binding);
        if base.is_null() {
            return;
        }

        // The pre-pass already invalidated the range and validated the
        // header, we just re-read it for the message slice bounds
        let header = unsafe { std::ptr::read_unaligned(base as *const StreamHeader) };
        let count = std::cmp::min(entry.pm_visible, header.capacity);

        let messages = unsafe {
            std::slice::from_raw_parts(
                base.add(STREAM_HEADER_SIZE as usize) as *const u64,
                count as usize,
            )
        };

        {
            let mut rep = report.lock().unwrap();
            rep.filtered_messages += count as u64;
        }

        for raw in messages {
            features.handle_message(GpuMessage(*raw), report);
        }
    }
}
