//! Aggregator HTTP API.
//!
//! JSON binding of the aggregator store: workers submit runs with
//! `POST /results`, dashboards and CI read runs, trends, failure statistics
//! and worker summaries.

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::storage::{AggregatorStore, RunQuery, RunResult, StorageError, defaults};
use crate::uploader::SubmitResponse;

/// Largest `limit` accepted by `/results` and `/failures/stats`.
pub const MAX_LIST_LIMIT: u32 = 500;

/// Largest `limit` accepted by `/trend`.
pub const MAX_TREND_LIMIT: u32 = 100;

/// Shared application state.
#[derive(Clone, Debug)]
pub struct AppState {
    pub store: AggregatorStore,
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    db: Option<String>,
}

/// Error body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Query parameters for the run list.
#[derive(Debug, Deserialize)]
pub struct RunsQueryParams {
    pub worker_id: Option<String>,
    pub project: Option<String>,
    pub branch: Option<String>,
    pub limit: Option<i64>,
}

/// Query parameters for trend and failure statistics.
#[derive(Debug, Deserialize)]
pub struct ProjectQueryParams {
    pub project: Option<String>,
    pub limit: Option<i64>,
}

// =============================================================================
// Errors
// =============================================================================

/// Handler failures mapped onto HTTP statuses.
#[derive(Debug)]
enum ApiError {
    Validation(String),
    NotFound(String),
    Storage(StorageError),
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidData(msg) => Self::Validation(msg),
            other => Self::Storage(other),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::Validation(e.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::Validation(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Storage(e) => {
                tracing::error!(error = %e, "Storage query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Handler failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(ErrorResponse { detail })).into_response()
    }
}

/// Check an optional `limit` against `1..=max`.
fn validated_limit(limit: Option<i64>, default: u32, max: u32) -> Result<u32, ApiError> {
    match limit {
        None => Ok(default),
        Some(n) if n >= 1 && n <= i64::from(max) => Ok(n as u32),
        Some(n) => Err(ApiError::Validation(format!(
            "limit must be between 1 and {max}, got {n}"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&AggregatorStore) -> Result<T, StorageError> + Send + 'static,
{
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError::Internal(format!("blocking task failed: {e}")))?
        .map_err(ApiError::from)
}

// =============================================================================
// Router
// =============================================================================

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    let app_state = Arc::new(state);

    Router::new()
        .route("/health", get(healthz_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/results", get(list_runs_handler).post(submit_handler))
        .route("/results/{run_id}", get(run_detail_handler))
        .route("/trend", get(trend_handler))
        .route("/failures/stats", get(failure_stats_handler))
        .route("/workers", get(workers_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Liveness probe.
async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        db: None,
    })
}

/// Readiness probe that checks the aggregator database.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> Response {
    match blocking(&state, |store| store.ping()).await {
        Ok(()) => Json(HealthResponse {
            status: "ok".to_string(),
            db: Some("ready".to_string()),
        })
        .into_response(),
        Err(err) => {
            let detail = match err {
                ApiError::Storage(e) => e.to_string(),
                ApiError::Validation(m) | ApiError::NotFound(m) | ApiError::Internal(m) => m,
            };
            tracing::error!(error = %detail, "Readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "not_ready".to_string(),
                    db: Some(detail),
                }),
            )
                .into_response()
        }
    }
}

/// `POST /results`: idempotent upsert by `run_id`.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RunResult>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let Json(mut run) = payload?;
    if run.run_id.as_deref().is_none_or(str::is_empty) {
        return Err(ApiError::Validation("run_id is required".to_string()));
    }
    run.normalize();

    let run_id = blocking(&state, move |store| store.save_run(&run)).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            run_id,
            status: "saved".to_string(),
        }),
    ))
}

/// `GET /results`: newest-first run summaries.
async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<RunsQueryParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let query = RunQuery {
        worker_id: non_empty(params.worker_id),
        project: non_empty(params.project),
        branch: non_empty(params.branch),
        limit: Some(validated_limit(
            params.limit,
            defaults::DEFAULT_RUNS_LIMIT,
            MAX_LIST_LIMIT,
        )?),
    };

    let runs = blocking(&state, move |store| store.get_runs(&query)).await?;
    Ok(Json(runs).into_response())
}

/// `GET /results/{run_id}`: one run with failure details.
async fn run_detail_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    let lookup = run_id.clone();
    match blocking(&state, move |store| store.get_run(&lookup)).await? {
        Some(detail) => Ok(Json(detail).into_response()),
        None => Err(ApiError::NotFound(format!("run_id '{run_id}' not found"))),
    }
}

/// `GET /trend`: chronological pass-rate series.
async fn trend_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ProjectQueryParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let limit = validated_limit(
        params.limit,
        defaults::AGGREGATOR_TREND_LIMIT,
        MAX_TREND_LIMIT,
    )?;
    let project = non_empty(params.project);

    let trend = blocking(&state, move |store| store.get_trend(project.as_deref(), limit)).await?;
    Ok(Json(trend).into_response())
}

/// `GET /failures/stats`: failure frequency over a window of runs.
async fn failure_stats_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ProjectQueryParams>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params?;
    let limit = validated_limit(
        params.limit,
        defaults::AGGREGATOR_STATS_WINDOW,
        MAX_LIST_LIMIT,
    )?;
    let project = non_empty(params.project);

    let stats = blocking(&state, move |store| {
        store.get_failure_stats(project.as_deref(), limit)
    })
    .await?;
    Ok(Json(stats).into_response())
}

/// `GET /workers`: per-worker summaries.
async fn workers_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let workers = blocking(&state, |store| store.get_workers()).await?;
    Ok(Json(workers).into_response())
}
