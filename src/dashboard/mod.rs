//! Read-only HTTP view of the masternode.
//!
//! - `GET /api/workers`: registered workers with their load and tasks
//! - `GET /api/metrics`: scheduler event counters

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::metrics::MetricsSnapshot;
use crate::scheduler::{MasterNode, WorkerSnapshot};

#[derive(Clone)]
pub struct DashboardState {
    pub master: Arc<MasterNode>,
}

#[derive(Serialize)]
struct WorkersResponse {
    generated_at: DateTime<Utc>,
    workers: Vec<WorkerSnapshot>,
    total_slots: u32,
    free_slots: u32,
}

#[derive(Serialize)]
struct MetricsResponse {
    generated_at: DateTime<Utc>,
    workers: usize,
    #[serde(flatten)]
    counters: MetricsSnapshot,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/workers", get(workers_handler))
        .route("/api/metrics", get(metrics_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let workers = state.master.status().await;
    let total_slots = workers.iter().map(|w| w.max_slots).sum();
    let free_slots = workers.iter().map(|w| w.slots).sum();
    Json(WorkersResponse {
        generated_at: Utc::now(),
        workers,
        total_slots,
        free_slots,
    })
}

async fn metrics_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(MetricsResponse {
        generated_at: Utc::now(),
        workers: state.master.worker_count().await,
        counters: state.master.metrics().snapshot(),
    })
}
