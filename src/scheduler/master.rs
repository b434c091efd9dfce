use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::error::Result;
use crate::grpc::worker_client::{WorkerConnector, WorkerRpc};
use crate::jobsource::{ChampionStatus, JobSource, MatchStatus};
use crate::metrics::MasterMetrics;
use crate::scheduler::outcome::{self, CompilationOutcome, MatchOutcome};
use crate::scheduler::registry::WorkerRegistry;
use crate::scheduler::task::{
    CompilationJob, JobKind, MatchJob, Task, TaskContext, TaskKey, TaskKind, TaskRef,
};
use crate::scheduler::worker::{WorkerHandle, WorkerInfo, WorkerKey, WorkerSnapshot};
use crate::storage::Storage;

/// What a janitor sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out_workers: Vec<WorkerKey>,
    pub redispatched: Vec<TaskKey>,
    pub resubmitted: Vec<TaskKey>,
    pub failed: Vec<TaskKey>,
}

/// The masternode scheduler.
///
/// Owns the worker registry and reconciles it with the job source. The
/// registry lock is never held across an RPC or a database call: every
/// operation decides under the lock, then performs its I/O after releasing
/// it.
pub struct MasterNode {
    config: MasterConfig,
    registry: RwLock<WorkerRegistry>,
    ctx: TaskContext,
    connector: Arc<dyn WorkerConnector>,
    metrics: Arc<MasterMetrics>,
}

impl MasterNode {
    pub fn new(
        config: MasterConfig,
        jobs: Arc<dyn JobSource>,
        connector: Arc<dyn WorkerConnector>,
    ) -> Self {
        let storage = Storage::new(config.contest.clone());
        Self {
            config,
            registry: RwLock::new(WorkerRegistry::new()),
            ctx: TaskContext::new(jobs, storage),
            connector,
            metrics: Arc::new(MasterMetrics::new()),
        }
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MasterMetrics> {
        &self.metrics
    }

    pub fn storage(&self) -> &Storage {
        &self.ctx.storage
    }

    /// Snapshots of every registered worker.
    pub async fn status(&self) -> Vec<WorkerSnapshot> {
        self.registry.read().await.snapshot()
    }

    pub async fn worker_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Whether a task with this key is held by some worker.
    pub async fn is_tracked(&self, key: &TaskKey) -> bool {
        self.registry.read().await.is_tracked(key)
    }

    /// Register a worker or refresh its capacity and liveness.
    ///
    /// A new worker is probed first and dropped if unreachable. Returns
    /// whether the worker is registered afterwards.
    pub async fn update_worker(&self, info: WorkerInfo) -> bool {
        let key = info.key();
        {
            let mut registry = self.registry.write().await;
            if let Some(worker) = registry.get_mut(&key) {
                worker.update(info.slots, info.max_slots);
                return true;
            }
        }

        let rpc = match self.connector.connect(&key.host, key.port) {
            Ok(rpc) => rpc,
            Err(e) => {
                tracing::warn!(worker = %key, error = %e, "Cannot connect to worker, dropping it");
                return false;
            }
        };
        let worker = WorkerHandle::new(key.clone(), info.slots, info.max_slots, rpc);
        if !worker.reachable().await {
            tracing::warn!(worker = %key, "Worker unreachable, dropping it");
            return false;
        }

        let mut registry = self.registry.write().await;
        match registry.get_mut(&key) {
            // Registered concurrently while we probed.
            Some(existing) => existing.update(info.slots, info.max_slots),
            None => registry.register(worker),
        }
        true
    }

    /// Process a worker heartbeat.
    ///
    /// A heartbeat flagged `first` comes from a freshly started worker process:
    /// whatever the masternode believes it was running is lost, so those tasks
    /// are sent back to the queue before the worker is registered again.
    pub async fn heartbeat(&self, info: WorkerInfo, first: bool) -> bool {
        let key = info.key();
        tracing::debug!(
            worker = %key,
            slots = info.slots,
            max_slots = info.max_slots,
            first,
            "Heartbeat"
        );

        if first {
            let lost = {
                let mut registry = self.registry.write().await;
                self.take_worker(&mut registry, &key)
            };
            self.redispatch_all(&lost).await;
        }
        self.update_worker(info).await
    }

    /// Remove a worker from the registry and hand back its tasks.
    fn take_worker(&self, registry: &mut WorkerRegistry, key: &WorkerKey) -> Vec<TaskRef> {
        let Some(mut worker) = registry.remove(key) else {
            return Vec::new();
        };
        let tasks = worker.drain_tasks();
        if !tasks.is_empty() {
            self.metrics.task_redispatch.add(tasks.len() as u64);
            tracing::info!(worker = %key, count = tasks.len(), "Redispatching worker tasks");
        }
        tasks
    }

    async fn redispatch_all(&self, tasks: &[TaskRef]) {
        for task in tasks {
            tracing::info!(task = %task, "Redispatching task");
            if let Err(e) = task.redispatch(&self.ctx).await {
                self.metrics.exceptions.inc();
                tracing::error!(task = %task.key(), error = %e, "Failed to redispatch task");
            }
        }
    }

    /// Detach a completed task from the worker that reported it.
    ///
    /// Reports from unknown workers, or for tasks the worker no longer holds
    /// (already redispatched or reported), are discarded.
    async fn complete_task(&self, info: &WorkerInfo, key: TaskKey) -> Option<TaskRef> {
        let worker_key = info.key();
        let mut registry = self.registry.write().await;
        let Some(worker) = registry.get_mut(&worker_key) else {
            self.metrics.zombie_worker.inc();
            tracing::warn!(worker = %worker_key, task = %key, "Result from unknown worker, discarding");
            return None;
        };
        match worker.remove_task(&key) {
            Some(task) => Some(task),
            None => {
                tracing::info!(worker = %worker_key, task = %key, "Result for a task the worker does not hold, discarding");
                None
            }
        }
    }

    /// Handle a compilation report. Returns false if it was discarded.
    pub async fn compilation_done(
        &self,
        info: WorkerInfo,
        user: &str,
        champion_id: i64,
        result: CompilationOutcome,
    ) -> bool {
        let Some(task) = self
            .complete_task(&info, TaskKey::Compilation(champion_id))
            .await
        else {
            return false;
        };

        let user = match task.kind() {
            TaskKind::Compilation(job) => job.username.as_str(),
            _ => user,
        };
        if let Err(e) =
            outcome::record_compilation(&self.ctx, &self.metrics, user, champion_id, &result).await
        {
            self.metrics.exceptions.inc();
            tracing::error!(champion_id, error = %e, "Failed to record compilation result");
        }
        true
    }

    /// Handle a match report. Returns false if it was discarded.
    pub async fn match_done(&self, info: WorkerInfo, match_id: i64, result: MatchOutcome) -> bool {
        if self
            .complete_task(&info, TaskKey::Match(match_id))
            .await
            .is_none()
        {
            return false;
        }

        if let Err(e) = outcome::record_match(&self.ctx, &self.metrics, match_id, &result).await {
            self.metrics.exceptions.inc();
            tracing::error!(match_id, error = %e, "Failed to record match result");
        }
        true
    }

    /// One janitor pass.
    ///
    /// Workers silent for longer than the worker timeout are removed and their
    /// tasks redispatched. On the remaining workers, a task whose RPC never
    /// reached the worker is redispatched without using up a try. Other timed
    /// out or errored tasks are resubmitted while they have tries left and
    /// failed otherwise.
    pub async fn janitor_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut lost = Vec::new();
        let mut resubmit: Vec<(TaskRef, Arc<dyn WorkerRpc>)> = Vec::new();
        let mut exhausted = Vec::new();
        let mut unreachable = Vec::new();
        let max_tries = self.config.limits.max_task_tries;

        {
            let mut registry = self.registry.write().await;

            for key in registry.dead_workers(self.config.worker_timeout) {
                self.metrics.worker_timeout.inc();
                tracing::warn!(worker = %key, "Timeout detected for worker");
                lost.extend(self.take_worker(&mut registry, &key));
                report.timed_out_workers.push(key);
            }

            for worker in registry.workers_mut() {
                let stale: Vec<TaskRef> = worker
                    .tasks()
                    .filter(|t| t.has_timeout() || t.has_error())
                    .cloned()
                    .collect();

                for task in stale {
                    let reason = task
                        .error()
                        .unwrap_or_else(|| "timed out".to_string());
                    if task.has_transport_error() {
                        tracing::info!(
                            worker = %worker.key(),
                            task = %task,
                            reason = %reason,
                            "Worker unreachable, redispatching task"
                        );
                        worker.remove_task(&task.key());
                        unreachable.push(task);
                    } else if task.executions() < max_tries {
                        tracing::info!(
                            worker = %worker.key(),
                            task = %task,
                            tries = task.executions(),
                            reason = %reason,
                            "Resubmitting task"
                        );
                        task.begin_attempt();
                        resubmit.push((task, worker.rpc()));
                    } else {
                        tracing::info!(
                            worker = %worker.key(),
                            task = %task,
                            reason = %reason,
                            "Maximum number of tries exceeded, failing task"
                        );
                        worker.remove_task(&task.key());
                        exhausted.push(task);
                    }
                }
            }
        }

        self.metrics.transport_error.add(unreachable.len() as u64);
        self.metrics.task_redispatch.add(unreachable.len() as u64);
        lost.extend(unreachable);
        report.redispatched = lost.iter().map(|t| t.key()).collect();
        report.resubmitted = resubmit.iter().map(|(t, _)| t.key()).collect();
        report.failed = exhausted.iter().map(|t| t.key()).collect();

        self.metrics.task_resubmit.add(resubmit.len() as u64);
        for (task, rpc) in resubmit {
            let ctx = self.ctx.clone();
            tokio::spawn(async move { task.execute(&ctx, rpc.as_ref()).await });
        }

        self.redispatch_all(&lost).await;

        self.metrics.task_fail.add(exhausted.len() as u64);
        for task in &exhausted {
            if let Err(e) = task.fail(&self.ctx).await {
                self.metrics.exceptions.inc();
                tracing::error!(task = %task.key(), error = %e, "Failed to mark task as failed");
            }
        }

        report
    }

    pub async fn run_janitor(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.janitor_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.janitor_sweep().await;
        }
        tracing::debug!("Janitor stopped");
    }

    /// Send every job left `pending` by a previous masternode back to the
    /// queue. Returns how many jobs were redispatched.
    pub async fn recover_pending(&self, kind: JobKind) -> Result<usize> {
        let tasks = self.fetch_tasks(kind, false).await?;
        if !tasks.is_empty() {
            tracing::info!(queue = %kind, count = tasks.len(), "Recovering pending jobs");
        }
        for task in &tasks {
            task.redispatch(&self.ctx).await?;
        }
        Ok(tasks.len())
    }

    /// Build tasks from the `new` (or, with `new == false`, `pending`) rows of
    /// a queue. Jobs already held by a worker are skipped.
    async fn fetch_tasks(&self, kind: JobKind, new: bool) -> Result<Vec<Task>> {
        let limits = &self.config.limits;
        let tasks: Vec<Task> = match kind {
            JobKind::Compilation => {
                let status = if new {
                    ChampionStatus::New
                } else {
                    ChampionStatus::Pending
                };
                self.ctx
                    .jobs
                    .get_champions(status)
                    .await?
                    .into_iter()
                    .map(|row| {
                        Task::compilation(
                            CompilationJob {
                                champion_id: row.champion_id,
                                username: row.username,
                            },
                            limits,
                        )
                    })
                    .collect()
            }
            JobKind::Match => {
                let status = if new {
                    MatchStatus::New
                } else {
                    MatchStatus::Pending
                };
                self.ctx
                    .jobs
                    .get_matches(status)
                    .await?
                    .into_iter()
                    .map(|row| {
                        Task::new_match(
                            MatchJob {
                                match_id: row.match_id,
                                map_contents: row.map_contents,
                                players: row.players,
                            },
                            limits,
                        )
                    })
                    .collect()
            }
        };

        if !new {
            return Ok(tasks);
        }
        let registry = self.registry.read().await;
        Ok(tasks
            .into_iter()
            .filter(|t| !registry.is_tracked(&t.key()))
            .collect())
    }

    /// Assign tasks in order until one cannot be placed, then wait for the
    /// RPC phase of every assigned task. Returns how many were dispatched.
    pub async fn dispatch_tasks(&self, kind: JobKind, tasks: Vec<Task>) -> usize {
        if tasks.is_empty() {
            return 0;
        }
        tracing::debug!(queue = %kind, count = tasks.len(), "Tasks in queue");

        let mut handles = Vec::new();
        {
            let mut registry = self.registry.write().await;
            for task in tasks {
                let task = Arc::new(task);
                let Some(key) = registry.find_worker_for(&task) else {
                    tracing::debug!(task = %task, "No worker available");
                    break;
                };
                let Some(worker) = registry.get_mut(&key) else {
                    break;
                };
                tracing::info!(worker = %key, task = %task, "Dispatching task");
                self.metrics.task_dispatch.inc();
                handles.push(worker.add_task(task, &self.ctx));
            }
        }

        let dispatched = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                self.metrics.exceptions.inc();
                tracing::error!(error = %e, "Task execution panicked");
            }
        }
        dispatched
    }

    /// One dbwatcher iteration: fetch the queue and dispatch what fits.
    pub async fn poll_jobs(&self, kind: JobKind) -> Result<usize> {
        let tasks = self.fetch_tasks(kind, true).await?;
        let requests = match kind {
            JobKind::Compilation => &self.metrics.compilation_requests,
            JobKind::Match => &self.metrics.match_requests,
        };
        for task in &tasks {
            tracing::debug!(task = %task, "Requested");
        }
        requests.add(tasks.len() as u64);
        Ok(self.dispatch_tasks(kind, tasks).await)
    }

    /// Watch one queue until shutdown.
    ///
    /// Pending jobs are recovered once, then the queue is polled every
    /// dbwatcher interval. Any failure is logged and retried after the
    /// backoff delay.
    pub async fn run_dbwatcher(self: Arc<Self>, kind: JobKind, shutdown: CancellationToken) {
        let mut recovered = false;
        loop {
            let step = if recovered {
                self.poll_jobs(kind).await.map(|_| self.config.dbwatcher_interval)
            } else {
                self.recover_pending(kind).await.map(|_| {
                    recovered = true;
                    std::time::Duration::ZERO
                })
            };

            let delay = match step {
                Ok(delay) => delay,
                Err(e) => {
                    self.metrics.exceptions.inc();
                    tracing::error!(queue = %kind, error = %e, "dbwatcher iteration failed");
                    self.config.dbwatcher_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(queue = %kind, "dbwatcher stopped");
    }
}
