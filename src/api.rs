use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogStore;
use crate::db::DbHandle;
use crate::errors::VigilError;
use crate::events::EventHub;
use crate::models::{Objective, Run, Step, User, WorkflowSession};
use crate::runs::{CreateRunInput, RunManager};
use crate::stream::{ChannelKind, channel_sse};
use crate::workflow::{CreateWorkflowInput, WorkflowOrchestrator};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub hub: EventHub,
    pub runs: RunManager,
    pub workflows: WorkflowOrchestrator,
    pub catalog: Arc<dyn CatalogStore>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub tool: String,
    pub scope_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub params: serde_json::Value,
    pub timeout_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct CreateRunResponse {
    pub id: String,
    pub status: String,
    pub tool: String,
    pub created_at: String,
}

impl From<Run> for CreateRunResponse {
    fn from(run: Run) -> Self {
        Self {
            id: run.id,
            status: run.status.to_string(),
            tool: run.tool,
            created_at: run.created_at,
        }
    }
}

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    pub target: String,
    pub objective: String,
    pub max_steps: Option<i32>,
    pub name: Option<String>,
}

#[derive(Serialize)]
pub struct CreateWorkflowResponse {
    #[serde(flatten)]
    pub session: WorkflowSession,
    pub steps: Vec<Step>,
    pub queue_position: i64,
}

// ── Identity ──────────────────────────────────────────────────────────

/// Resolve the caller through the catalog. Identity arrives as an
/// `x-user-id` header; users live in the external store.
async fn current_user(state: &SharedState, headers: &HeaderMap) -> Result<User, VigilError> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| VigilError::Validation("x-user-id header is required".into()))?;
    state
        .catalog
        .get_user(user_id)
        .await?
        .ok_or_else(|| VigilError::Forbidden(format!("Unknown user '{}'", user_id)))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/runs/{id}/stream", get(stream_run))
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/cancel", post(cancel_workflow))
        .route("/api/workflows/{id}/stream", get(stream_workflow))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_run(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, VigilError> {
    let user = current_user(&state, &headers).await?;
    let run = state
        .runs
        .create(
            &user,
            CreateRunInput {
                tool: req.tool,
                scope_id: req.scope_id,
                target: req.target,
                params: req.params,
                timeout_secs: req.timeout_secs,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(CreateRunResponse::from(run))))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, VigilError> {
    let runs = state.runs.list().await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, VigilError> {
    let detail = state.runs.get(&id).await?;
    Ok(Json(detail))
}

async fn stop_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, VigilError> {
    let user = current_user(&state, &headers).await?;
    let run = state.runs.stop(&user, &id).await?;
    Ok(Json(run))
}

async fn delete_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, VigilError> {
    let user = current_user(&state, &headers).await?;
    state.runs.delete(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, VigilError> {
    // Verify the run exists before opening the long-lived connection.
    state.runs.get(&id).await?;
    Ok(channel_sse(
        state.db.clone(),
        state.hub.clone(),
        ChannelKind::Run,
        id,
    ))
}

async fn create_workflow(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, VigilError> {
    let user = current_user(&state, &headers).await?;
    let objective = Objective::from_str(&req.objective).map_err(VigilError::Validation)?;
    let created = state
        .workflows
        .create(
            &user,
            CreateWorkflowInput {
                target: req.target,
                objective,
                max_steps: req.max_steps,
                name: req.name,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateWorkflowResponse {
            session: created.session,
            steps: created.steps,
            queue_position: created.queue_position,
        }),
    ))
}

async fn list_workflows(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, VigilError> {
    let sessions = state.workflows.list().await?;
    Ok(Json(sessions))
}

async fn get_workflow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, VigilError> {
    let detail = state.workflows.get(&id).await?;
    Ok(Json(detail))
}

async fn cancel_workflow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, VigilError> {
    let user = current_user(&state, &headers).await?;
    let detail = state.workflows.cancel(&user, &id).await?;
    Ok(Json(detail))
}

async fn delete_workflow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, VigilError> {
    let user = current_user(&state, &headers).await?;
    state.workflows.delete(&user, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stream_workflow(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, VigilError> {
    state.workflows.get(&id).await?;
    Ok(channel_sse(
        state.db.clone(),
        state.hub.clone(),
        ChannelKind::Session,
        id,
    ))
}
