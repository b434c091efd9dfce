//! Shared helpers for masternode integration tests.
//!
//! Provides a scripted in-process worker, a connector handing it out, and a
//! masternode wired to an in-memory job source over a temporary contest
//! directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use masternode::config::{ContestConfig, MasterConfig};
use masternode::error::RpcError;
use masternode::grpc::worker_client::{MatchPlayerPayload, WorkerConnector, WorkerRpc};
use masternode::jobsource::{ChampionStatus, MatchPlayerRow, MemoryJobSource};
use masternode::scheduler::{MasterNode, WorkerInfo};
use masternode::storage::{self, Storage};

pub const GAME: &str = "testgame";
pub const WORKER_PORT: u16 = 8068;

/// A recorded `RunMatch` call.
#[derive(Debug, Clone)]
pub struct MatchCall {
    pub match_id: i64,
    pub players: HashMap<i64, MatchPlayerPayload>,
    pub map_contents: Option<String>,
}

/// Worker double: accepts every job unless told otherwise and records
/// what it was asked to run.
pub struct FakeWorker {
    reachable: AtomicBool,
    failure: Mutex<Option<RpcError>>,
    compilations: Mutex<Vec<(String, i64, String)>>,
    matches: Mutex<Vec<MatchCall>>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            failure: Mutex::new(None),
            compilations: Mutex::new(Vec::new()),
            matches: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make every following job call fail with `failure`.
    pub fn fail_with(&self, failure: Option<RpcError>) {
        *self.failure.lock().unwrap() = failure;
    }

    /// Champion ids of the compilations received, in order.
    pub fn compilations(&self) -> Vec<i64> {
        self.compilations
            .lock()
            .unwrap()
            .iter()
            .map(|(_, id, _)| *id)
            .collect()
    }

    pub fn compilation_payloads(&self) -> Vec<(String, i64, String)> {
        self.compilations.lock().unwrap().clone()
    }

    pub fn matches(&self) -> Vec<MatchCall> {
        self.matches.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<(), RpcError> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkerRpc for FakeWorker {
    async fn reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn compile_champion(
        &self,
        user: &str,
        champion_id: i64,
        champion_tgz: String,
    ) -> Result<(), RpcError> {
        self.compilations
            .lock()
            .unwrap()
            .push((user.to_string(), champion_id, champion_tgz));
        self.check_failure()
    }

    async fn run_match(
        &self,
        match_id: i64,
        players: HashMap<i64, MatchPlayerPayload>,
        map_contents: Option<String>,
    ) -> Result<(), RpcError> {
        self.matches.lock().unwrap().push(MatchCall {
            match_id,
            players,
            map_contents,
        });
        self.check_failure()
    }
}

/// Hands out registered [`FakeWorker`]s by host.
#[derive(Default)]
pub struct FakeConnector {
    workers: Mutex<HashMap<String, Arc<FakeWorker>>>,
}

impl FakeConnector {
    pub fn add(&self, host: &str) -> Arc<FakeWorker> {
        let worker = Arc::new(FakeWorker::new());
        self.workers
            .lock()
            .unwrap()
            .insert(host.to_string(), worker.clone());
        worker
    }
}

impl WorkerConnector for FakeConnector {
    fn connect(&self, host: &str, _port: u16) -> Result<Arc<dyn WorkerRpc>, RpcError> {
        match self.workers.lock().unwrap().get(host) {
            Some(worker) => Ok(worker.clone()),
            None => Err(RpcError::Transport(format!("no route to {}", host))),
        }
    }
}

/// A masternode over an in-memory job source and a temporary contest tree.
pub struct TestMaster {
    pub master: Arc<MasterNode>,
    pub jobs: Arc<MemoryJobSource>,
    pub connector: Arc<FakeConnector>,
    pub storage: Storage,
    pub dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> MasterConfig {
    let mut config = MasterConfig::default();
    config.contest = ContestConfig {
        directory: dir.path().to_path_buf(),
        game: GAME.to_string(),
    };
    config
}

impl TestMaster {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut MasterConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir);
        adjust(&mut config);

        let jobs = Arc::new(MemoryJobSource::new());
        let connector = Arc::new(FakeConnector::default());
        let storage = Storage::new(config.contest.clone());
        let master = Arc::new(MasterNode::new(config, jobs.clone(), connector.clone()));
        Self {
            master,
            jobs,
            connector,
            storage,
            dir,
        }
    }

    /// Register a fake worker with `max_slots` free slots.
    pub async fn add_worker(&self, host: &str, max_slots: u32) -> Arc<FakeWorker> {
        let worker = self.connector.add(host);
        assert!(self.master.update_worker(worker_info(host, max_slots, max_slots)).await);
        worker
    }

    /// A champion in `new` state with its source on disk.
    pub async fn add_champion(&self, champion_id: i64, user: &str) {
        let dir = self.storage.champion_dir(user, champion_id);
        self.storage.create_dir(&dir).await.unwrap();
        self.storage
            .write(&dir.join(storage::CHAMPION_SOURCE), source_of(champion_id))
            .await
            .unwrap();
        self.jobs.add_champion(champion_id, user, ChampionStatus::New);
    }

    /// A compiled champion ready to play matches.
    pub async fn add_compiled_champion(&self, champion_id: i64, user: &str) {
        let dir = self.storage.champion_dir(user, champion_id);
        self.storage.create_dir(&dir).await.unwrap();
        self.storage
            .write(&dir.join(storage::CHAMPION_COMPILED), compiled_of(champion_id))
            .await
            .unwrap();
        self.jobs
            .add_champion(champion_id, user, ChampionStatus::Ready);
    }

    /// Free slots of a worker as tracked by the masternode.
    pub async fn slots_of(&self, host: &str) -> Option<u32> {
        self.master
            .status()
            .await
            .into_iter()
            .find(|w| w.host == host)
            .map(|w| w.slots)
    }
}

pub fn worker_info(host: &str, slots: u32, max_slots: u32) -> WorkerInfo {
    WorkerInfo {
        host: host.to_string(),
        port: WORKER_PORT,
        slots,
        max_slots,
    }
}

pub fn player(champion_id: i64, player_id: i64, user: &str) -> MatchPlayerRow {
    MatchPlayerRow {
        champion_id,
        player_id,
        username: user.to_string(),
    }
}

pub fn source_of(champion_id: i64) -> Vec<u8> {
    format!("source of champion {}", champion_id).into_bytes()
}

pub fn compiled_of(champion_id: i64) -> Vec<u8> {
    format!("compiled champion {}", champion_id).into_bytes()
}

/// Wait for a condition to become true.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration, poll: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll).await;
    }
    condition().await
}

pub async fn assert_eventually<F, Fut>(condition: F, timeout: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
