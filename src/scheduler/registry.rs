use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::scheduler::task::{TaskKey, TaskRef};
use crate::scheduler::worker::{WorkerHandle, WorkerKey, WorkerSnapshot};

/// The set of known workers, keyed by advertised address.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerKey, WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any previous record under the same key.
    pub fn register(&mut self, worker: WorkerHandle) {
        tracing::info!(
            worker = %worker.key(),
            max_slots = worker.max_slots(),
            "Worker registered"
        );
        self.workers.insert(worker.key().clone(), worker);
    }

    pub fn contains(&self, key: &WorkerKey) -> bool {
        self.workers.contains_key(key)
    }

    pub fn get(&self, key: &WorkerKey) -> Option<&WorkerHandle> {
        self.workers.get(key)
    }

    pub fn get_mut(&mut self, key: &WorkerKey) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(key)
    }

    pub fn remove(&mut self, key: &WorkerKey) -> Option<WorkerHandle> {
        self.workers.remove(key)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    pub fn workers_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
        self.workers.values_mut()
    }

    /// Pick the least loaded worker able to take `task`.
    ///
    /// Candidates are shuffled before the stable minimum is taken, so workers
    /// with equal usage are picked at random.
    pub fn find_worker_for(&self, task: &TaskRef) -> Option<WorkerKey> {
        let mut candidates: Vec<&WorkerHandle> = self
            .workers
            .values()
            .filter(|w| w.can_add_task(task))
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .min_by(|a, b| a.usage().total_cmp(&b.usage()))
            .map(|w| w.key().clone())
    }

    /// Whether any worker currently holds the task.
    pub fn is_tracked(&self, key: &TaskKey) -> bool {
        self.workers.values().any(|w| w.has_task(key))
    }

    pub fn dead_workers(&self, timeout: Duration) -> Vec<WorkerKey> {
        let mut dead: Vec<WorkerKey> = self
            .workers
            .values()
            .filter(|w| !w.is_alive(timeout))
            .map(|w| w.key().clone())
            .collect();
        dead.sort();
        dead
    }

    /// Snapshots of every worker, ordered by address.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<&WorkerHandle> = self.workers.values().collect();
        workers.sort_by(|a, b| a.key().cmp(b.key()));
        workers.into_iter().map(|w| w.snapshot()).collect()
    }

    pub fn task_count(&self) -> usize {
        self.workers.values().map(|w| w.task_count()).sum()
    }
}
