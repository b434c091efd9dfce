use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::error::Result;
use crate::grpc::auth::SecretCheck;
use crate::grpc::master_service::MasterServiceImpl;
use crate::proto::master_service_server::MasterServiceServer;
use crate::scheduler::MasterNode;

pub struct GrpcServer {
    addr: SocketAddr,
    master: Arc<MasterNode>,
    secret: SecretCheck,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, master: Arc<MasterNode>, secret: SecretCheck) -> Self {
        Self {
            addr,
            master,
            secret,
        }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let service = MasterServiceImpl::new(self.master);

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(MasterServiceServer::with_interceptor(service, self.secret))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await?;
        Ok(())
    }

    /// Serve on an already bound listener, used when the port is picked by
    /// the OS.
    pub async fn run_with_listener(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let service = MasterServiceImpl::new(self.master);
        let incoming = tonic::transport::server::TcpIncoming::from_listener(listener, true, None)
            .map_err(|e| crate::error::MasterError::Internal(e.to_string()))?;

        Server::builder()
            .add_service(MasterServiceServer::with_interceptor(service, self.secret))
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await?;
        Ok(())
    }
}
