use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::proto::master_service_server::MasterService;
use crate::proto::{
    Ack, CompilationDoneRequest, CompilationResult, HeartbeatRequest, MatchDoneRequest,
    MatchResult, StatusRequest, StatusResponse, UpdateWorkerRequest, WorkerStatus,
};
use crate::scheduler::{
    CompilationOutcome, MasterNode, MatchOutcome, PlayerOutcome, WorkerInfo,
};

fn worker_info(worker: Option<crate::proto::WorkerInfo>) -> Result<WorkerInfo, Status> {
    let worker = worker.ok_or_else(|| Status::invalid_argument("Missing worker"))?;
    let port = u16::try_from(worker.port)
        .map_err(|_| Status::invalid_argument(format!("Invalid port {}", worker.port)))?;
    if worker.host.is_empty() {
        return Err(Status::invalid_argument("Missing worker host"));
    }
    Ok(WorkerInfo {
        host: worker.host,
        port,
        slots: worker.slots,
        max_slots: worker.max_slots,
    })
}

impl From<CompilationResult> for CompilationOutcome {
    fn from(result: CompilationResult) -> Self {
        Self {
            success: result.success,
            error: result.error,
            stdout: result.stdout,
            champion_compiled: result.champion_compiled,
        }
    }
}

impl From<MatchResult> for MatchOutcome {
    fn from(result: MatchResult) -> Self {
        Self {
            success: result.success,
            error: result.error,
            stdout: result.stdout,
            stderr: result.stderr,
            dump: result.dump,
            replay: result.replay,
            stats: result.stats,
            players: result
                .players
                .into_iter()
                .map(|(player_id, p)| {
                    (
                        player_id,
                        PlayerOutcome {
                            champion_id: p.champion_id,
                            stdout: p.stdout,
                        },
                    )
                })
                .collect(),
            match_result: result.match_result,
        }
    }
}

fn ack(accepted: bool) -> Response<Ack> {
    Response::new(Ack { accepted })
}

/// Masternode RPC surface called by workers.
pub struct MasterServiceImpl {
    master: Arc<MasterNode>,
}

impl MasterServiceImpl {
    pub fn new(master: Arc<MasterNode>) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl MasterService for MasterServiceImpl {
    async fn update_worker(
        &self,
        request: Request<UpdateWorkerRequest>,
    ) -> Result<Response<Ack>, Status> {
        let info = worker_info(request.into_inner().worker)?;
        Ok(ack(self.master.update_worker(info).await))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let info = worker_info(req.worker)?;
        Ok(ack(self.master.heartbeat(info, req.first).await))
    }

    async fn compilation_done(
        &self,
        request: Request<CompilationDoneRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let info = worker_info(req.worker)?;
        let result = req
            .result
            .ok_or_else(|| Status::invalid_argument("Missing compilation result"))?;
        let accepted = self
            .master
            .compilation_done(info, &req.user, req.champion_id, result.into())
            .await;
        Ok(ack(accepted))
    }

    async fn match_done(
        &self,
        request: Request<MatchDoneRequest>,
    ) -> Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let info = worker_info(req.worker)?;
        let result = req
            .result
            .ok_or_else(|| Status::invalid_argument("Missing match result"))?;
        let accepted = self
            .master
            .match_done(info, req.match_id, result.into())
            .await;
        Ok(ack(accepted))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let workers = self
            .master
            .status()
            .await
            .into_iter()
            .map(|w| WorkerStatus {
                host: w.host,
                port: w.port as u32,
                slots: w.slots,
                max_slots: w.max_slots,
            })
            .collect();
        Ok(Response::new(StatusResponse { workers }))
    }
}
