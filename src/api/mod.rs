//! HTTP front end: a thin router over [`Orchestrator`].

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::FleetError;
use crate::scheduler::{Job, Orchestrator};
use crate::store::RecordStore;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn RecordStore>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub id: String,
    pub launched_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: String,
    pub name: String,
    pub status: String,
    pub capacity: usize,
    pub timelimit_secs: u64,
    pub hash_type: String,
    pub workers: Vec<WorkerResponse>,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            name: job.name.clone(),
            status: job.status.to_string(),
            capacity: job.capacity,
            timelimit_secs: job.timelimit.as_secs(),
            hash_type: job.payload.hash_type.clone(),
            workers: job
                .workers
                .values()
                .map(|w| WorkerResponse {
                    id: w.id.to_string(),
                    launched_at: w.launched_at,
                })
                .collect(),
            created_at: job.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartJobRequest {
    /// Tear down whatever came up if the start is incomplete
    #[serde(default = "default_rollback")]
    rollback: bool,
}

fn default_rollback() -> bool {
    true
}

/// Body returned when a job could not be fully started.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartFailureResponse {
    pub error: String,
    pub failures: usize,
    pub workers: Vec<String>,
    pub rolled_back: bool,
    pub rollback_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/jobs/:id", get(get_job_handler))
        .route("/api/jobs/:id/start", post(start_job_handler))
        .route("/api/jobs/:id/stop", post(stop_job_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn list_jobs_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = state
        .orchestrator
        .registry()
        .list()
        .await
        .iter()
        .map(JobResponse::from)
        .collect();

    Json(jobs)
}

async fn get_job_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.registry().get(&id).await {
        Some(job) => Json(JobResponse::from(&job)).into_response(),
        None => error_response(StatusCode::NOT_FOUND, FleetError::JobNotFound(id)),
    }
}

async fn start_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Option<Json<StartJobRequest>>,
) -> Response {
    let rollback = payload.map(|Json(req)| req.rollback).unwrap_or(true);

    let record = match state.store.get(&id).await {
        Ok(Some(record)) => record,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, FleetError::JobNotFound(id)),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let partial = match state.orchestrator.start_job(Job::from_record(&record)).await {
        Ok(job) => return Json(JobResponse::from(&job)).into_response(),
        Err(partial) => partial,
    };

    if partial.already_running() {
        return error_response(StatusCode::CONFLICT, FleetError::JobAlreadyRunning(id));
    }

    let workers: Vec<String> = partial.job.workers.keys().map(|w| w.to_string()).collect();
    let (rolled_back, rollback_error) = if rollback {
        match state.orchestrator.rollback(partial.job.clone()).await {
            Ok(()) => (true, None),
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Rollback of partial start failed");
                (false, Some(e.to_string()))
            }
        }
    } else {
        tracing::warn!(job_id = %id, workers = workers.len(), "Partial fleet left running");
        (false, None)
    };

    (
        StatusCode::BAD_GATEWAY,
        Json(StartFailureResponse {
            error: partial.to_string(),
            failures: partial.errors.len(),
            workers,
            rolled_back,
            rollback_error,
        }),
    )
        .into_response()
}

async fn stop_job_handler(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.stop_job_by_id(&id).await {
        Ok(job) => Json(JobResponse::from(&job)).into_response(),
        Err(e @ FleetError::JobNotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}
