use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Count and total duration of a timed section.
#[derive(Debug, Default)]
pub struct Timing {
    count: AtomicU64,
    total_us: AtomicU64,
}

impl Timing {
    pub fn observe(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_us: self.total_us.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub total_us: u64,
}

/// Scheduler event counters and result-handling timings.
#[derive(Debug, Default)]
pub struct MasterMetrics {
    /// Tasks handed to a worker by the dbwatcher
    pub task_dispatch: Counter,
    /// Tasks sent back to the queue because their worker went away
    pub task_redispatch: Counter,
    /// Timed out or errored tasks retried on their worker
    pub task_resubmit: Counter,
    /// Tasks failed after exhausting their tries
    pub task_fail: Counter,
    /// Task RPCs that never reached their worker
    pub transport_error: Counter,
    pub worker_timeout: Counter,
    /// Completion reports from workers that are not registered
    pub zombie_worker: Counter,
    /// Match reports whose score list could not be parsed
    pub bad_result: Counter,
    /// Errors caught by the background loops
    pub exceptions: Counter,
    pub compilation_requests: Counter,
    pub match_requests: Counter,
    /// Writing the artifacts of a match report
    pub match_done_file: Timing,
    /// Writing the scores and status of a match report
    pub match_done_db: Timing,
    /// Writing the artifacts of a compilation report
    pub compilation_done_file: Timing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub task_dispatch: u64,
    pub task_redispatch: u64,
    pub task_resubmit: u64,
    pub task_fail: u64,
    pub transport_error: u64,
    pub worker_timeout: u64,
    pub zombie_worker: u64,
    pub bad_result: u64,
    pub exceptions: u64,
    pub compilation_requests: u64,
    pub match_requests: u64,
    pub match_done_file: TimingSnapshot,
    pub match_done_db: TimingSnapshot,
    pub compilation_done_file: TimingSnapshot,
}

impl MasterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            task_dispatch: self.task_dispatch.get(),
            task_redispatch: self.task_redispatch.get(),
            task_resubmit: self.task_resubmit.get(),
            task_fail: self.task_fail.get(),
            transport_error: self.transport_error.get(),
            worker_timeout: self.worker_timeout.get(),
            zombie_worker: self.zombie_worker.get(),
            bad_result: self.bad_result.get(),
            exceptions: self.exceptions.get(),
            compilation_requests: self.compilation_requests.get(),
            match_requests: self.match_requests.get(),
            match_done_file: self.match_done_file.snapshot(),
            match_done_db: self.match_done_db.snapshot(),
            compilation_done_file: self.compilation_done_file.snapshot(),
        }
    }
}
