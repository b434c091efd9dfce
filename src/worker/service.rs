use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::config::WorkerConfig;
use crate::error::RpcError;
use crate::grpc::worker_client::AuthedChannel;
use crate::proto::master_service_client::MasterServiceClient;
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    CompilationDoneRequest, CompilationResult, CompileChampionRequest, HeartbeatRequest,
    MatchDoneRequest, MatchResult, PlayerResult, ReachableRequest, ReachableResponse,
    RunMatchRequest, TaskAccepted, UpdateWorkerRequest, WorkerInfo,
};
use crate::storage::{decode_b64, encode_b64};
use crate::worker::executor::{CompilationOutput, JobExecutor, MatchOutput, MatchParticipant};

/// Slot cost of each job kind on this worker.
pub const COMPILATION_SLOTS: u32 = 1;
pub const MATCH_SLOTS: u32 = 5;

/// A worker node: accepts jobs from the masternode while it has free
/// slots, runs them in the background and reports the results.
pub struct WorkerNode {
    config: WorkerConfig,
    free_slots: AtomicU32,
    executor: JobExecutor,
    master: MasterServiceClient<AuthedChannel>,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig, master: MasterServiceClient<AuthedChannel>) -> Self {
        Self {
            free_slots: AtomicU32::new(config.max_slots),
            executor: JobExecutor::new(config.executor.clone()),
            config,
            master,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn free_slots(&self) -> u32 {
        self.free_slots.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            host: self.config.hostname.clone(),
            port: self.config.port() as u32,
            slots: self.free_slots(),
            max_slots: self.config.max_slots,
        }
    }

    /// Take `n` slots if they are free.
    fn try_reserve(&self, n: u32) -> bool {
        self.free_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| free.checked_sub(n))
            .is_ok()
    }

    fn release(&self, n: u32) {
        let max = self.config.max_slots;
        let _ = self
            .free_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |free| {
                Some((free + n).min(max))
            });
    }

    pub async fn send_heartbeat(&self, first: bool) -> Result<bool, RpcError> {
        let mut master = self.master.clone();
        let resp = master
            .heartbeat(HeartbeatRequest {
                worker: Some(self.info()),
                first,
            })
            .await?;
        Ok(resp.into_inner().accepted)
    }

    async fn update_master(&self) {
        let mut master = self.master.clone();
        if let Err(e) = master
            .update_worker(UpdateWorkerRequest {
                worker: Some(self.info()),
            })
            .await
        {
            tracing::warn!(error = %e, "Failed to send capacity update to masternode");
        }
    }

    async fn run_compilation(self: Arc<Self>, user: String, champion_id: i64, source: Vec<u8>) {
        let output = self.executor.compile(champion_id, &source).await;
        self.release(COMPILATION_SLOTS);

        let mut master = self.master.clone();
        let request = CompilationDoneRequest {
            worker: Some(self.info()),
            user,
            champion_id,
            result: Some(compilation_result(output)),
        };
        match master.compilation_done(request).await {
            Ok(resp) if !resp.get_ref().accepted => {
                tracing::info!(champion_id, "Masternode discarded compilation result");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(champion_id, error = %e, "Failed to report compilation result");
            }
        }
        self.update_master().await;
    }

    async fn run_match(
        self: Arc<Self>,
        match_id: i64,
        participants: Vec<MatchParticipant>,
        map: Option<Vec<u8>>,
    ) {
        let output = self
            .executor
            .run_match(match_id, &participants, map.as_deref())
            .await;
        self.release(MATCH_SLOTS);

        let mut master = self.master.clone();
        let request = MatchDoneRequest {
            worker: Some(self.info()),
            match_id,
            result: Some(match_result(output, &participants)),
        };
        match master.match_done(request).await {
            Ok(resp) if !resp.get_ref().accepted => {
                tracing::info!(match_id, "Masternode discarded match result");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(match_id, error = %e, "Failed to report match result"),
        }
        self.update_master().await;
    }
}

fn compilation_result(output: CompilationOutput) -> CompilationResult {
    CompilationResult {
        success: output.success,
        error: output.error,
        stdout: Some(output.log),
        champion_compiled: output.compiled.as_deref().map(encode_b64),
    }
}

fn match_result(output: MatchOutput, participants: &[MatchParticipant]) -> MatchResult {
    let players = participants
        .iter()
        .map(|p| {
            (
                p.player_id,
                PlayerResult {
                    champion_id: p.champion_id,
                    stdout: output.player_logs.get(&p.player_id).cloned(),
                },
            )
        })
        .collect();
    MatchResult {
        success: output.success,
        error: output.error,
        stdout: Some(output.stdout),
        stderr: Some(output.stderr),
        dump: output.dump.as_deref().map(encode_b64),
        replay: output.replay.as_deref().map(encode_b64),
        stats: output.stats.as_deref().map(encode_b64),
        players,
        match_result: output.match_result,
    }
}

fn invalid_payload(what: &str, e: crate::storage::StorageError) -> Status {
    Status::invalid_argument(format!("Invalid {}: {}", what, e))
}

/// gRPC front of a [`WorkerNode`].
pub struct WorkerServiceImpl {
    node: Arc<WorkerNode>,
}

impl WorkerServiceImpl {
    pub fn new(node: Arc<WorkerNode>) -> Self {
        Self { node }
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerServiceImpl {
    async fn reachable(
        &self,
        _request: Request<ReachableRequest>,
    ) -> Result<Response<ReachableResponse>, Status> {
        Ok(Response::new(ReachableResponse { reachable: true }))
    }

    async fn compile_champion(
        &self,
        request: Request<CompileChampionRequest>,
    ) -> Result<Response<TaskAccepted>, Status> {
        let req = request.into_inner();
        let source = decode_b64("champion_tgz", &req.champion_tgz)
            .map_err(|e| invalid_payload("champion tarball", e))?;

        if !self.node.try_reserve(COMPILATION_SLOTS) {
            return Err(Status::resource_exhausted("No free slot for compilation"));
        }
        tracing::info!(user = %req.user, champion_id = req.champion_id, "Compilation accepted");

        let node = self.node.clone();
        tokio::spawn(node.run_compilation(req.user, req.champion_id, source));

        Ok(Response::new(TaskAccepted {
            slots_taken: COMPILATION_SLOTS,
        }))
    }

    async fn run_match(
        &self,
        request: Request<RunMatchRequest>,
    ) -> Result<Response<TaskAccepted>, Status> {
        let req = request.into_inner();
        let mut participants = Vec::with_capacity(req.players.len());
        for (player_id, player) in req.players {
            participants.push(MatchParticipant {
                player_id,
                champion_id: player.champion_id,
                compiled: decode_b64("champion_compiled", &player.champion_compiled)
                    .map_err(|e| invalid_payload("compiled champion", e))?,
            });
        }
        participants.sort_by_key(|p| p.player_id);
        let map = req
            .map_contents
            .as_deref()
            .map(|m| decode_b64("map_contents", m))
            .transpose()
            .map_err(|e| invalid_payload("map", e))?;

        if !self.node.try_reserve(MATCH_SLOTS) {
            return Err(Status::resource_exhausted("No free slots for match"));
        }
        tracing::info!(match_id = req.match_id, "Match accepted");

        let node = self.node.clone();
        tokio::spawn(node.run_match(req.match_id, participants, map));

        Ok(Response::new(TaskAccepted {
            slots_taken: MATCH_SLOTS,
        }))
    }
}
