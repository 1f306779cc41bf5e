use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::store::{Job, JobStore};

#[derive(Clone)]
pub struct DashboardState {
    pub store: Arc<JobStore>,
}

#[derive(Serialize)]
struct StateCount {
    state: String,
    count: i64,
}

#[derive(Serialize)]
struct JobsResponse {
    summary: Vec<StateCount>,
    jobs: Vec<Job>,
}

/// Build the read-only jobs API router.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the jobs API until the shutdown token fires.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, token: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    let shutdown = async move { token.cancelled().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs = match state.store.jobs_by_state(None).await {
        Ok(jobs) => jobs,
        Err(e) => {
            tracing::error!(error = %e, "Dashboard job query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let summary = match state.store.counts_by_state().await {
        Ok(counts) => counts
            .into_iter()
            .map(|(state, count)| StateCount {
                state: state.to_string(),
                count,
            })
            .collect(),
        Err(e) => {
            tracing::error!(error = %e, "Dashboard summary query failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    Json(JobsResponse { summary, jobs }).into_response()
}
