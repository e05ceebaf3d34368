//! Submission API: a thin axum surface over the [`Coordinator`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use meshflow_model::{Blueprint, DataReference, DockerInfo, EngineError};

use crate::coordinator::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::InvalidBlueprint(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub blueprint: Blueprint,
    pub dockerinfo: DockerInfo,
    #[serde(default)]
    pub inputs: Vec<DataReference>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub workflow_id: Uuid,
    pub status: meshflow_model::WorkflowStatus,
}

async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let workflow_id = state
        .coordinator
        .submit(req.blueprint, req.dockerinfo, req.inputs)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            workflow_id,
            status: meshflow_model::WorkflowStatus::Pending,
        }),
    ))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::coordinator::WorkflowView>, ApiError> {
    Ok(Json(state.coordinator.observe(id).await?))
}

#[derive(Debug, Serialize)]
struct TasksResponse {
    tasks: Vec<crate::coordinator::TaskView>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TasksResponse>, ApiError> {
    let tasks = state.coordinator.list_tasks(id).await?;
    Ok(Json(TasksResponse { tasks }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(submit))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/tasks", get(list_tasks))
        .route("/health", get(health))
        .with_state(state)
}
