use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::grpc::auth::{SecretCheck, SecretInjector};
use crate::grpc::worker_client::{GrpcWorkerConnector, WorkerConnector};
use crate::grpc::GrpcServer;
use crate::jobsource::JobSource;
use crate::scheduler::{JobKind, MasterNode};

/// Calls to workers give up after this long; the task is then left with an
/// error for the janitor to retry.
const WORKER_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Masternode process: the scheduler plus every loop and server around it.
pub struct Node {
    pub config: MasterConfig,
    pub master: Arc<MasterNode>,
    pub dashboard_addr: Option<SocketAddr>,
}

impl Node {
    /// Build a node talking to workers over gRPC.
    pub fn new(
        config: MasterConfig,
        jobs: Arc<dyn JobSource>,
        dashboard_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        let injector = SecretInjector::new(config.shared_secret.as_deref())?;
        let connector: Arc<dyn WorkerConnector> =
            Arc::new(GrpcWorkerConnector::new(injector, WORKER_RPC_TIMEOUT));
        Ok(Self::with_connector(config, jobs, connector, dashboard_addr))
    }

    pub fn with_connector(
        config: MasterConfig,
        jobs: Arc<dyn JobSource>,
        connector: Arc<dyn WorkerConnector>,
        dashboard_addr: Option<SocketAddr>,
    ) -> Self {
        let master = Arc::new(MasterNode::new(config.clone(), jobs, connector));
        Self {
            config,
            master,
            dashboard_addr,
        }
    }

    /// Start the background loops without the RPC server.
    ///
    /// 1. The janitor, sweeping dead workers and stale tasks
    /// 2. One dbwatcher per queue (compilations and matches)
    /// 3. The dashboard, if an address was given
    pub fn spawn_background(&self, shutdown: &CancellationToken) {
        tokio::spawn(self.master.clone().run_janitor(shutdown.clone()));
        for kind in [JobKind::Compilation, JobKind::Match] {
            tokio::spawn(self.master.clone().run_dbwatcher(kind, shutdown.clone()));
        }

        if let Some(addr) = self.dashboard_addr {
            let state = DashboardState {
                master: self.master.clone(),
            };
            tokio::spawn(run_dashboard(addr, state, shutdown.clone()));
        }
    }

    /// Run the masternode until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server cannot start or fails. The
    /// background loops log and recover from their own errors.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            addr = %self.config.listen_addr,
            contest = %self.config.contest.directory.display(),
            game = %self.config.contest.game,
            worker_timeout_secs = self.config.worker_timeout.as_secs(),
            max_task_tries = self.config.limits.max_task_tries,
            "Starting masternode"
        );

        let check = SecretCheck::new(self.config.shared_secret.as_deref())?;
        self.spawn_background(&shutdown);

        let server = GrpcServer::new(self.config.listen_addr, self.master.clone(), check);
        server.run(shutdown).await
    }
}
