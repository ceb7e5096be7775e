//! JSON HTTP surface over the [`Fleet`] facade.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Liveness plus scheduler, cache, and lease stats |
//! | `GET`  | `/golden` | List golden repositories |
//! | `POST` | `/golden` | Add a golden repository (job) |
//! | `GET`  | `/golden/{alias}` | One golden repository |
//! | `DELETE` | `/golden/{alias}` | Remove a golden repository (job) |
//! | `POST` | `/golden/{alias}/refresh` | Refresh (job) |
//! | `POST` | `/golden/{alias}/branch` | Change branch (job) |
//! | `POST` | `/golden/{alias}/reindex` | Rebuild indexes (job) |
//! | `POST` | `/golden/{alias}/indexes` | Add an index kind (job) |
//! | `GET`  | `/golden/{alias}/health` | Index health, `?force=true` bypasses the probe cache |
//! | `POST` | `/golden/{alias}/write-mode` | Enter write mode |
//! | `DELETE` | `/golden/{alias}/write-mode` | Exit write mode; blocks until the closing refresh ends |
//! | `POST` | `/activated` | Activate a workspace (job) |
//! | `GET`  | `/activated/{owner}` | List an owner's workspaces |
//! | `DELETE` | `/activated/{owner}/{alias}` | Deactivate (job) |
//! | `POST` | `/activated/{owner}/{alias}/sync` | Sync with golden (job) |
//! | `POST` | `/activated/{owner}/{alias}/branch` | Switch branch (job) |
//! | `POST` | `/composites` | Create, update, or delete a composite (job) |
//! | `GET`  | `/jobs` | List jobs, filtered by `owner`, `status`, `target`, `limit` |
//! | `GET`  | `/jobs/{id}` | Poll one job |
//! | `POST` | `/query` | Multi-repository search or file listing |
//! | `GET`  | `/cache/{handle}` | One page of a cached result, `?page=N` (1-based) |
//!
//! Job submissions answer `202 Accepted` with the job id. Errors carry
//! `{ "success": false, "error": ..., "error_kind": ... }` with the status
//! derived from the error kind.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::aggregate::{AggregationRequest, AggregationResponse};
use crate::backend::IndexKind;
use crate::cache::{CacheLookup, CachePage};
use crate::error::{ErrorKind, FleetError};
use crate::fleet::{Fleet, FleetStats, OpResponse};
use crate::golden::{AddRepoRequest, RepoHealth};
use crate::models::{ActivatedWorkspace, GoldenRepository, Job, JobStatus};
use crate::scheduler::JobFilter;
use crate::workspace::{ActivateRequest, CompositeOp};
use crate::write_mode::{ExitOutcome, LeaseInfo};

#[derive(Clone)]
struct AppState {
    fleet: Arc<Fleet>,
}

/// Serve the fleet on `[server].bind` until the process ends.
pub async fn run_server(fleet: Arc<Fleet>) -> anyhow::Result<()> {
    let bind_addr = fleet.config().server.bind.clone();
    let app = router(fleet);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "fleet server listening");
    println!("Fleet server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(fleet: Arc<Fleet>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/golden", get(handle_list_golden).post(handle_add_golden))
        .route(
            "/golden/{alias}",
            get(handle_get_golden).delete(handle_remove_golden),
        )
        .route("/golden/{alias}/refresh", post(handle_refresh))
        .route("/golden/{alias}/branch", post(handle_change_branch))
        .route("/golden/{alias}/reindex", post(handle_reindex))
        .route("/golden/{alias}/indexes", post(handle_add_index))
        .route("/golden/{alias}/health", get(handle_golden_health))
        .route(
            "/golden/{alias}/write-mode",
            post(handle_enter_write_mode).delete(handle_exit_write_mode),
        )
        .route("/activated", post(handle_activate))
        .route("/activated/{owner}", get(handle_list_workspaces))
        .route(
            "/activated/{owner}/{alias}",
            get(handle_get_workspace).delete(handle_deactivate),
        )
        .route("/activated/{owner}/{alias}/sync", post(handle_sync))
        .route("/activated/{owner}/{alias}/branch", post(handle_switch_branch))
        .route("/composites", post(handle_composite))
        .route("/jobs", get(handle_list_jobs))
        .route("/jobs/{id}", get(handle_get_job))
        .route("/query", post(handle_query))
        .route("/cache/{handle}", get(handle_cache_page))
        .layer(cors)
        .with_state(AppState { fleet })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    error_kind: ErrorKind,
}

struct AppError {
    kind: ErrorKind,
    message: String,
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::BackendFailure | ErrorKind::PartialFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<FleetError> for AppError {
    fn from(err: FleetError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.message,
            error_kind: self.kind,
        };
        (status_for(self.kind), Json(body)).into_response()
    }
}

impl IntoResponse for OpResponse {
    fn into_response(self) -> Response {
        let status = match self.error_kind {
            None => StatusCode::ACCEPTED,
            Some(kind) => status_for(kind),
        };
        (status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============ Health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    stats: FleetStats,
}

async fn handle_health(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: state.fleet.stats().await?,
    }))
}

// ============ Golden repositories ============

#[derive(Deserialize)]
struct BranchBody {
    branch: String,
}

#[derive(Deserialize)]
struct AddIndexBody {
    kind: IndexKind,
}

#[derive(Deserialize)]
struct HealthParams {
    #[serde(default)]
    force: bool,
}

async fn handle_list_golden(State(state): State<AppState>) -> ApiResult<Vec<GoldenRepository>> {
    Ok(Json(state.fleet.list_golden().await?))
}

async fn handle_add_golden(
    State(state): State<AppState>,
    Json(req): Json<AddRepoRequest>,
) -> OpResponse {
    state.fleet.add_golden(req).await
}

async fn handle_get_golden(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> ApiResult<GoldenRepository> {
    Ok(Json(state.fleet.get_golden(&alias).await?))
}

async fn handle_remove_golden(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> OpResponse {
    state.fleet.remove_golden(&alias).await
}

async fn handle_refresh(State(state): State<AppState>, Path(alias): Path<String>) -> OpResponse {
    state.fleet.refresh_golden(&alias).await
}

async fn handle_change_branch(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Json(body): Json<BranchBody>,
) -> OpResponse {
    state.fleet.change_branch(&alias, &body.branch).await
}

async fn handle_reindex(State(state): State<AppState>, Path(alias): Path<String>) -> OpResponse {
    state.fleet.reindex_golden(&alias).await
}

async fn handle_add_index(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Json(body): Json<AddIndexBody>,
) -> OpResponse {
    state.fleet.add_index(&alias, body.kind).await
}

async fn handle_golden_health(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    Query(params): Query<HealthParams>,
) -> ApiResult<RepoHealth> {
    Ok(Json(state.fleet.golden_health(&alias, params.force).await?))
}

async fn handle_enter_write_mode(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> ApiResult<LeaseInfo> {
    Ok(Json(state.fleet.enter_write_mode(&alias).await?))
}

async fn handle_exit_write_mode(
    State(state): State<AppState>,
    Path(alias): Path<String>,
) -> ApiResult<ExitOutcome> {
    Ok(Json(state.fleet.exit_write_mode(&alias).await?))
}

// ============ Activated workspaces ============

#[derive(Deserialize)]
struct CompositeBody {
    op: CompositeOp,
    owner: String,
    user_alias: String,
    #[serde(default)]
    golden_aliases: Vec<String>,
}

async fn handle_activate(
    State(state): State<AppState>,
    Json(req): Json<ActivateRequest>,
) -> OpResponse {
    state.fleet.activate(req).await
}

async fn handle_list_workspaces(
    State(state): State<AppState>,
    Path(owner): Path<String>,
) -> ApiResult<Vec<ActivatedWorkspace>> {
    Ok(Json(state.fleet.list_workspaces(&owner).await?))
}

async fn handle_get_workspace(
    State(state): State<AppState>,
    Path((owner, alias)): Path<(String, String)>,
) -> ApiResult<ActivatedWorkspace> {
    Ok(Json(state.fleet.get_workspace(&owner, &alias).await?))
}

async fn handle_deactivate(
    State(state): State<AppState>,
    Path((owner, alias)): Path<(String, String)>,
) -> OpResponse {
    state.fleet.deactivate(&owner, &alias).await
}

async fn handle_sync(
    State(state): State<AppState>,
    Path((owner, alias)): Path<(String, String)>,
) -> OpResponse {
    state.fleet.sync_workspace(&owner, &alias).await
}

async fn handle_switch_branch(
    State(state): State<AppState>,
    Path((owner, alias)): Path<(String, String)>,
    Json(body): Json<BranchBody>,
) -> OpResponse {
    state.fleet.switch_branch(&owner, &alias, &body.branch).await
}

async fn handle_composite(
    State(state): State<AppState>,
    Json(body): Json<CompositeBody>,
) -> OpResponse {
    state
        .fleet
        .manage_composite(body.op, &body.owner, &body.user_alias, body.golden_aliases)
        .await
}

// ============ Jobs ============

#[derive(Deserialize)]
struct JobParams {
    owner: Option<String>,
    status: Option<JobStatus>,
    target: Option<String>,
    limit: Option<usize>,
}

async fn handle_list_jobs(
    State(state): State<AppState>,
    Query(params): Query<JobParams>,
) -> ApiResult<Vec<Job>> {
    let filter = JobFilter {
        owner: params.owner,
        status: params.status,
        target: params.target,
        limit: params.limit,
    };
    Ok(Json(state.fleet.list_jobs(&filter).await?))
}

async fn handle_get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Job> {
    Ok(Json(state.fleet.poll_job(&id).await?))
}

// ============ Query and cache ============

#[derive(Deserialize)]
struct PageParams {
    page: Option<usize>,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<AggregationRequest>,
) -> ApiResult<AggregationResponse> {
    Ok(Json(state.fleet.query(req).await?))
}

async fn handle_cache_page(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<CachePage> {
    match state.fleet.cache_page(&handle, params.page.unwrap_or(1))? {
        CacheLookup::Page(page) => Ok(Json(page)),
        CacheLookup::NotFound => Err(FleetError::not_found(format!("cache handle '{}'", handle)).into()),
        CacheLookup::Expired => Err(FleetError::not_found(format!(
            "cache handle '{}' has expired",
            handle
        ))
        .into()),
    }
}
