use thiserror::Error;

use crate::jobsource::JobSourceError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("Job source error: {0}")]
    JobSource(#[from] JobSourceError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Malformed result: {0}")]
    MalformedResult(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MasterError>;

/// Failure of a call made to a remote node.
///
/// A transport failure means the peer could not be talked to at all and is a
/// candidate for redispatch; a remote failure means the peer answered with an
/// application error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote error ({code:?}): {message}")]
    Remote { code: tonic::Code, message: String },
}

impl RpcError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => RpcError::Transport(status.message().to_string()),
            code => RpcError::Remote {
                code,
                message: status.message().to_string(),
            },
        }
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(err: tonic::transport::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}
