//! Worker node.
//!
//! Serves the `WorkerService` RPCs the masternode calls, runs the accepted
//! jobs through shell commands and reports results back.
//!
//! # Components
//!
//! - [`JobExecutor`]: runs compilations and matches in scratch directories
//! - [`WorkerNode`]: slot accounting and result reporting
//! - [`HeartbeatSender`]: keeps the worker registered on the masternode
//!
//! # Flow
//!
//! 1. The masternode calls `CompileChampion` or `RunMatch`
//! 2. The job is accepted if enough slots are free, rejected with
//!    `RESOURCE_EXHAUSTED` otherwise
//! 3. The executor runs it in the background
//! 4. The result goes back through `CompilationDone` / `MatchDone`, followed
//!    by an `UpdateWorker` with the freed capacity

pub mod executor;
pub mod heartbeat;
pub mod service;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

pub use executor::JobExecutor;
pub use heartbeat::HeartbeatSender;
pub use service::{WorkerNode, WorkerServiceImpl};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::grpc::auth::{SecretCheck, SecretInjector};
use crate::grpc::worker_client::master_client;
use crate::proto::worker_service_server::WorkerServiceServer;

/// Requests to the masternode give up after this long.
const MASTER_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a worker node until `shutdown` is cancelled.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> Result<()> {
    let secret = config.shared_secret.as_deref();
    let master = master_client(
        &config.master_addr,
        SecretInjector::new(secret)?,
        MASTER_RPC_TIMEOUT,
    )?;
    let check = SecretCheck::new(secret)?;
    let node = Arc::new(WorkerNode::new(config.clone(), master));

    let heartbeat = HeartbeatSender::new(config.heartbeat_interval);
    let hb_node = node.clone();
    let hb_shutdown = shutdown.clone();
    tokio::spawn(async move {
        heartbeat.run(hb_node, hb_shutdown).await;
    });

    tracing::info!(
        addr = %config.listen_addr,
        hostname = %config.hostname,
        max_slots = config.max_slots,
        master = %config.master_addr,
        "Starting worker node"
    );

    Server::builder()
        .add_service(WorkerServiceServer::with_interceptor(
            WorkerServiceImpl::new(node),
            check,
        ))
        .serve_with_shutdown(config.listen_addr, shutdown.cancelled_owned())
        .await?;
    Ok(())
}
