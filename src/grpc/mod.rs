//! gRPC plumbing between the masternode and its workers.
//!
//! - [`master_service`]: the `MasterService` served by the masternode
//! - [`worker_client`]: how the masternode calls workers, and how workers
//!   and the CLI reach the masternode
//! - [`auth`]: shared secret interceptors for both directions

pub mod auth;
pub mod master_service;
pub mod server;
pub mod worker_client;

pub use server::GrpcServer;
