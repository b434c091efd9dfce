use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::grpc::worker_client::WorkerRpc;
use crate::scheduler::task::{TaskContext, TaskKey, TaskRef};

/// Workers are identified by the address they advertise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub host: String,
    pub port: u16,
}

impl WorkerKey {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Address and capacity a worker sends with every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub host: String,
    pub port: u16,
    /// Free slots as seen by the worker
    pub slots: u32,
    pub max_slots: u32,
}

impl WorkerInfo {
    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(self.host.clone(), self.port)
    }
}

/// Point-in-time view of a worker, as shown by the status RPC and dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub host: String,
    pub port: u16,
    pub slots: u32,
    pub max_slots: u32,
    /// Free slots as last reported by the worker itself
    pub reported_slots: u32,
    pub usage: f64,
    pub tasks: Vec<String>,
    pub last_heartbeat_ms: u64,
}

/// Masternode-side record of a worker and the tasks it holds.
///
/// Free slots are derived from the tasks held: `slots == max_slots - sum of
/// slots_taken`, floored at zero if the worker shrinks below its load.
pub struct WorkerHandle {
    key: WorkerKey,
    max_slots: u32,
    used_slots: u32,
    reported_slots: u32,
    last_heartbeat: Instant,
    tasks: HashMap<TaskKey, TaskRef>,
    rpc: Arc<dyn WorkerRpc>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("key", &self.key)
            .field("max_slots", &self.max_slots)
            .field("used_slots", &self.used_slots)
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl WorkerHandle {
    pub fn new(key: WorkerKey, slots: u32, max_slots: u32, rpc: Arc<dyn WorkerRpc>) -> Self {
        Self {
            key,
            max_slots,
            used_slots: 0,
            reported_slots: slots,
            last_heartbeat: Instant::now(),
            tasks: HashMap::new(),
            rpc,
        }
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn max_slots(&self) -> u32 {
        self.max_slots
    }

    pub fn slots(&self) -> u32 {
        self.max_slots.saturating_sub(self.used_slots)
    }

    pub fn reported_slots(&self) -> u32 {
        self.reported_slots
    }

    /// Fraction of capacity in use, 1.0 for a worker without slots.
    pub fn usage(&self) -> f64 {
        if self.max_slots == 0 {
            return 1.0;
        }
        1.0 - self.slots() as f64 / self.max_slots as f64
    }

    pub fn rpc(&self) -> Arc<dyn WorkerRpc> {
        self.rpc.clone()
    }

    pub async fn reachable(&self) -> bool {
        self.rpc.reachable().await
    }

    pub fn can_add_task(&self, task: &TaskRef) -> bool {
        self.slots() >= task.slots_taken()
    }

    /// Track `task` on this worker, start a new attempt and spawn its RPC
    /// phase. The returned handle resolves once the worker answered.
    pub fn add_task(&mut self, task: TaskRef, ctx: &TaskContext) -> JoinHandle<()> {
        self.used_slots += task.slots_taken();
        task.begin_attempt();
        self.tasks.insert(task.key(), task.clone());

        let ctx = ctx.clone();
        let rpc = self.rpc.clone();
        tokio::spawn(async move { task.execute(&ctx, rpc.as_ref()).await })
    }

    /// Stop tracking a task. Removing an unknown task changes nothing.
    pub fn remove_task(&mut self, key: &TaskKey) -> Option<TaskRef> {
        let task = self.tasks.remove(key)?;
        self.used_slots = self.used_slots.saturating_sub(task.slots_taken());
        task.retire();
        Some(task)
    }

    /// Hand back every task, leaving the worker empty.
    pub fn drain_tasks(&mut self) -> Vec<TaskRef> {
        self.used_slots = 0;
        let mut tasks: Vec<TaskRef> = self.tasks.drain().map(|(_, t)| t).collect();
        tasks.sort_by_key(|t| t.key());
        for task in &tasks {
            task.retire();
        }
        tasks
    }

    pub fn get_task(&self, key: &TaskKey) -> Option<&TaskRef> {
        self.tasks.get(key)
    }

    pub fn has_task(&self, key: &TaskKey) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskRef> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Record a heartbeat or capacity report.
    pub fn update(&mut self, slots: u32, max_slots: u32) {
        self.reported_slots = slots;
        self.max_slots = max_slots;
        self.last_heartbeat = Instant::now();
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.last_heartbeat.elapsed() < timeout
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let mut tasks: Vec<TaskKey> = self.tasks.keys().copied().collect();
        tasks.sort();
        WorkerSnapshot {
            host: self.key.host.clone(),
            port: self.key.port,
            slots: self.slots(),
            max_slots: self.max_slots,
            reported_slots: self.reported_slots,
            usage: self.usage(),
            tasks: tasks.iter().map(|k| k.to_string()).collect(),
            last_heartbeat_ms: self.last_heartbeat.elapsed().as_millis() as u64,
        }
    }
}
