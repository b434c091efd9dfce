use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Endpoint};

use crate::error::RpcError;
use crate::grpc::auth::SecretInjector;
use crate::proto::master_service_client::MasterServiceClient;
use crate::proto::worker_service_client::WorkerServiceClient;
use crate::proto::{CompileChampionRequest, MatchPlayer, ReachableRequest, RunMatchRequest};

/// Compiled champion sent along with a match request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchPlayerPayload {
    pub champion_id: i64,
    /// Base64 encoded compiled tarball
    pub champion_compiled: String,
}

/// Calls the masternode makes on a worker.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    /// Liveness probe; any failure counts as unreachable.
    async fn reachable(&self) -> bool;

    async fn compile_champion(
        &self,
        user: &str,
        champion_id: i64,
        champion_tgz: String,
    ) -> Result<(), RpcError>;

    async fn run_match(
        &self,
        match_id: i64,
        players: HashMap<i64, MatchPlayerPayload>,
        map_contents: Option<String>,
    ) -> Result<(), RpcError>;
}

/// Builds the RPC handle of a newly seen worker.
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn WorkerRpc>, RpcError>;
}

pub type AuthedChannel = InterceptedService<Channel, SecretInjector>;

fn endpoint(addr: &str, request_timeout: Duration) -> Result<Endpoint, RpcError> {
    let uri = format!("http://{}", addr);
    Endpoint::from_shared(uri)
        .map(|e| {
            e.connect_timeout(request_timeout)
                .timeout(request_timeout)
        })
        .map_err(|e| RpcError::Transport(format!("invalid endpoint {}: {}", addr, e)))
}

/// Client of the masternode used by workers and the status command.
/// The connection is opened on first use.
pub fn master_client(
    addr: &str,
    secret: SecretInjector,
    request_timeout: Duration,
) -> Result<MasterServiceClient<AuthedChannel>, RpcError> {
    let channel = endpoint(addr, request_timeout)?.connect_lazy();
    Ok(MasterServiceClient::with_interceptor(channel, secret))
}

/// gRPC client of one worker.
#[derive(Debug, Clone)]
pub struct GrpcWorkerClient {
    client: WorkerServiceClient<AuthedChannel>,
}

#[async_trait]
impl WorkerRpc for GrpcWorkerClient {
    async fn reachable(&self) -> bool {
        let mut client = self.client.clone();
        match client.reachable(ReachableRequest {}).await {
            Ok(resp) => resp.into_inner().reachable,
            Err(status) => {
                tracing::debug!(error = %status, "Reachability probe failed");
                false
            }
        }
    }

    async fn compile_champion(
        &self,
        user: &str,
        champion_id: i64,
        champion_tgz: String,
    ) -> Result<(), RpcError> {
        let mut client = self.client.clone();
        client
            .compile_champion(CompileChampionRequest {
                user: user.to_string(),
                champion_id,
                champion_tgz,
            })
            .await?;
        Ok(())
    }

    async fn run_match(
        &self,
        match_id: i64,
        players: HashMap<i64, MatchPlayerPayload>,
        map_contents: Option<String>,
    ) -> Result<(), RpcError> {
        let players = players
            .into_iter()
            .map(|(player_id, p)| {
                (
                    player_id,
                    MatchPlayer {
                        champion_id: p.champion_id,
                        champion_compiled: p.champion_compiled,
                    },
                )
            })
            .collect();
        let mut client = self.client.clone();
        client
            .run_match(RunMatchRequest {
                match_id,
                players,
                map_contents,
            })
            .await?;
        Ok(())
    }
}

/// Connects to workers over gRPC with lazily established channels.
#[derive(Debug, Clone)]
pub struct GrpcWorkerConnector {
    secret: SecretInjector,
    request_timeout: Duration,
}

impl GrpcWorkerConnector {
    pub fn new(secret: SecretInjector, request_timeout: Duration) -> Self {
        Self {
            secret,
            request_timeout,
        }
    }
}

impl WorkerConnector for GrpcWorkerConnector {
    fn connect(&self, host: &str, port: u16) -> Result<Arc<dyn WorkerRpc>, RpcError> {
        let addr = format!("{}:{}", host, port);
        let channel = endpoint(&addr, self.request_timeout)?.connect_lazy();
        Ok(Arc::new(GrpcWorkerClient {
            client: WorkerServiceClient::with_interceptor(channel, self.secret.clone()),
        }))
    }
}
