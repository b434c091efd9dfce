use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::TaskLimits;
use crate::error::{MasterError, Result, RpcError};
use crate::grpc::worker_client::{MatchPlayerPayload, WorkerRpc};
use crate::jobsource::{ChampionStatus, JobSource, JobSourceError, MatchPlayerRow, MatchStatus};
use crate::storage::{encode_b64, Storage};

/// The two job queues fed by the dbwatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Compilation,
    Match,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Compilation => f.write_str("compilation"),
            JobKind::Match => f.write_str("match"),
        }
    }
}

/// Identity of a task. A worker holds at most one task per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Compilation(i64),
    Match(i64),
}

impl TaskKey {
    pub fn kind(&self) -> JobKind {
        match self {
            TaskKey::Compilation(_) => JobKind::Compilation,
            TaskKey::Match(_) => JobKind::Match,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Compilation(id) => write!(f, "compilation:{}", id),
            TaskKey::Match(id) => write!(f, "match:{}", id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationJob {
    pub champion_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchJob {
    pub match_id: i64,
    pub map_contents: Option<String>,
    pub players: Vec<MatchPlayerRow>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Compilation(CompilationJob),
    Match(MatchJob),
}

/// Collaborators a task needs to run and to write its status back.
#[derive(Clone)]
pub struct TaskContext {
    pub jobs: Arc<dyn JobSource>,
    pub storage: Storage,
}

impl TaskContext {
    pub fn new(jobs: Arc<dyn JobSource>, storage: Storage) -> Self {
        Self { jobs, storage }
    }
}

#[derive(Debug, Default)]
struct Attempt {
    start_time: Option<Instant>,
    executions: u32,
    error: Option<String>,
    /// The error came from the link to the worker, not from the job.
    transport_failed: bool,
    /// Set once the task left its worker; a late execution must not mark
    /// the job pending again.
    retired: bool,
}

/// A unit of work tracked on a worker.
///
/// The attempt bookkeeping sits behind a short-lived lock so that the
/// execution future and the janitor can both observe it.
#[derive(Debug)]
pub struct Task {
    kind: TaskKind,
    slots_taken: u32,
    timeout: Option<Duration>,
    attempt: Mutex<Attempt>,
}

pub type TaskRef = Arc<Task>;

impl Task {
    pub fn compilation(job: CompilationJob, limits: &TaskLimits) -> Self {
        Self::new(
            TaskKind::Compilation(job),
            limits.compilation_slots,
            limits.compilation_timeout,
        )
    }

    pub fn new_match(job: MatchJob, limits: &TaskLimits) -> Self {
        Self::new(TaskKind::Match(job), limits.match_slots, limits.match_timeout)
    }

    pub fn new(kind: TaskKind, slots_taken: u32, timeout: Option<Duration>) -> Self {
        Self {
            kind,
            slots_taken,
            timeout,
            attempt: Mutex::new(Attempt::default()),
        }
    }

    fn attempt(&self) -> MutexGuard<'_, Attempt> {
        self.attempt.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn key(&self) -> TaskKey {
        match &self.kind {
            TaskKind::Compilation(job) => TaskKey::Compilation(job.champion_id),
            TaskKind::Match(job) => TaskKey::Match(job.match_id),
        }
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    pub fn slots_taken(&self) -> u32 {
        self.slots_taken
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn executions(&self) -> u32 {
        self.attempt().executions
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.attempt().start_time
    }

    pub fn error(&self) -> Option<String> {
        self.attempt().error.clone()
    }

    /// Start a new attempt: stamp the start time, count the execution and
    /// clear the previous error.
    pub fn begin_attempt(&self) {
        let mut attempt = self.attempt();
        attempt.start_time = Some(Instant::now());
        attempt.executions += 1;
        attempt.error = None;
        attempt.transport_failed = false;
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let mut attempt = self.attempt();
        attempt.error = Some(error.into());
        attempt.transport_failed = false;
    }

    /// Record an attempt that never reached the worker.
    pub fn record_transport_error(&self, error: impl Into<String>) {
        let mut attempt = self.attempt();
        attempt.error = Some(error.into());
        attempt.transport_failed = true;
    }

    pub fn retire(&self) {
        self.attempt().retired = true;
    }

    pub fn is_retired(&self) -> bool {
        self.attempt().retired
    }

    pub fn has_timeout(&self) -> bool {
        match (self.timeout, self.attempt().start_time) {
            (Some(timeout), Some(start)) => start.elapsed() > timeout,
            _ => false,
        }
    }

    pub fn has_error(&self) -> bool {
        self.attempt().error.is_some()
    }

    pub fn has_transport_error(&self) -> bool {
        let attempt = self.attempt();
        attempt.error.is_some() && attempt.transport_failed
    }

    /// Run the RPC phase of the current attempt against `worker`.
    ///
    /// Never fails: any error is stored on the task and picked up by the
    /// janitor on its next sweep. Transport failures are flagged so the job
    /// goes back to the queue instead of burning a try.
    pub async fn execute(&self, ctx: &TaskContext, worker: &dyn WorkerRpc) {
        match self.try_execute(ctx, worker).await {
            Ok(()) => {}
            Err(
                e @ (MasterError::TransportError(_) | MasterError::Rpc(RpcError::Transport(_))),
            ) => {
                tracing::warn!(task = %self.key(), error = %e, "Worker unreachable for task");
                self.record_transport_error(e.to_string());
            }
            Err(e) => {
                tracing::warn!(task = %self.key(), error = %e, "Task execution failed");
                self.record_error(e.to_string());
            }
        }
    }

    async fn try_execute(&self, ctx: &TaskContext, worker: &dyn WorkerRpc) -> Result<()> {
        match &self.kind {
            TaskKind::Compilation(job) => {
                let source = ctx
                    .storage
                    .read_champion_source(&job.username, job.champion_id)
                    .await?;
                worker
                    .compile_champion(&job.username, job.champion_id, encode_b64(&source))
                    .await?;
                if !self.is_retired() {
                    ctx.jobs
                        .set_champion_status(job.champion_id, ChampionStatus::Pending)
                        .await?;
                }
            }
            TaskKind::Match(job) => {
                ctx.storage
                    .create_dir(&ctx.storage.match_dir(job.match_id))
                    .await?;

                let mut players = HashMap::with_capacity(job.players.len());
                for player in &job.players {
                    let compiled = ctx
                        .storage
                        .read_compiled_champion(&player.username, player.champion_id)
                        .await?;
                    players.insert(
                        player.player_id,
                        MatchPlayerPayload {
                            champion_id: player.champion_id,
                            champion_compiled: encode_b64(&compiled),
                        },
                    );
                }
                let map_contents = job
                    .map_contents
                    .as_deref()
                    .map(|contents| encode_b64(contents.as_bytes()));

                worker.run_match(job.match_id, players, map_contents).await?;
                if !self.is_retired() {
                    ctx.jobs
                        .set_match_status(job.match_id, MatchStatus::Pending)
                        .await?;
                }
            }
        }
        tracing::debug!(task = %self.key(), "Task accepted by worker");
        Ok(())
    }

    /// Put the job back in the queue.
    pub async fn redispatch(&self, ctx: &TaskContext) -> std::result::Result<(), JobSourceError> {
        match &self.kind {
            TaskKind::Compilation(job) => {
                ctx.jobs
                    .set_champion_status(job.champion_id, ChampionStatus::New)
                    .await
            }
            TaskKind::Match(job) => ctx.jobs.set_match_status(job.match_id, MatchStatus::New).await,
        }
    }

    /// Give up on the job.
    pub async fn fail(&self, ctx: &TaskContext) -> std::result::Result<(), JobSourceError> {
        match &self.kind {
            TaskKind::Compilation(job) => {
                ctx.jobs
                    .set_champion_status(job.champion_id, ChampionStatus::Failed)
                    .await
            }
            TaskKind::Match(job) => {
                ctx.jobs
                    .set_match_status(job.match_id, MatchStatus::Failed)
                    .await
            }
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TaskKind::Compilation(job) => {
                write!(f, "compilation of {}/{}", job.username, job.champion_id)
            }
            TaskKind::Match(job) => {
                let champions: Vec<String> = job
                    .players
                    .iter()
                    .map(|p| p.champion_id.to_string())
                    .collect();
                write!(f, "match {} ({})", job.match_id, champions.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compilation(timeout: Option<Duration>) -> Task {
        Task::new(
            TaskKind::Compilation(CompilationJob {
                champion_id: 42,
                username: "alice".to_string(),
            }),
            1,
            timeout,
        )
    }

    #[test]
    fn key_and_cost_follow_kind() {
        let limits = TaskLimits::default();
        let task = Task::new_match(
            MatchJob {
                match_id: 7,
                map_contents: None,
                players: vec![],
            },
            &limits,
        );
        assert_eq!(task.key(), TaskKey::Match(7));
        assert_eq!(task.slots_taken(), 5);
        assert_eq!(task.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(task.key().to_string(), "match:7");
    }

    #[test]
    fn begin_attempt_counts_and_clears_error() {
        let task = compilation(None);
        assert_eq!(task.executions(), 0);
        assert!(task.start_time().is_none());

        task.begin_attempt();
        task.record_error("connection refused");
        assert!(task.has_error());

        task.begin_attempt();
        assert_eq!(task.executions(), 2);
        assert!(!task.has_error());
        assert!(task.start_time().is_some());
    }

    #[test]
    fn transport_flag_cleared_by_next_attempt() {
        let task = compilation(None);
        task.begin_attempt();
        task.record_transport_error("connection refused");
        assert!(task.has_error());
        assert!(task.has_transport_error());

        task.begin_attempt();
        task.record_error("no free slot");
        assert!(task.has_error());
        assert!(!task.has_transport_error());
    }

    #[test]
    fn no_timeout_before_first_attempt() {
        let task = compilation(Some(Duration::ZERO));
        assert!(!task.has_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_measured_from_attempt_start() {
        let task = compilation(Some(Duration::from_secs(400)));
        task.begin_attempt();
        assert!(!task.has_timeout());

        tokio::time::advance(Duration::from_secs(401)).await;
        assert!(task.has_timeout());

        task.begin_attempt();
        assert!(!task.has_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_task_never_times_out() {
        let task = compilation(None);
        task.begin_attempt();
        tokio::time::advance(Duration::from_secs(100_000)).await;
        assert!(!task.has_timeout());
    }

    #[test]
    fn display_names_the_job() {
        let task = compilation(None);
        assert_eq!(task.to_string(), "compilation of alice/42");
    }
}
