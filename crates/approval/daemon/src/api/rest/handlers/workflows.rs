//! Workflow definition handlers

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use approval_types::{ApprovalWorkflow, UserId, WorkflowDraft, WorkflowId};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

/// Create or update request: the draft plus the acting user
#[derive(Debug, Deserialize)]
pub struct WorkflowRequest {
    pub actor_id: UserId,
    #[serde(flatten)]
    pub workflow: WorkflowDraft,
}

/// Latest version of every active workflow
pub async fn list_workflows(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<ApprovalWorkflow>>> {
    Ok(Json(state.engine.list_active_workflows().await?))
}

pub async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<WorkflowRequest>,
) -> ApiResult<(StatusCode, Json<ApprovalWorkflow>)> {
    let workflow = state
        .engine
        .create_workflow(request.workflow, &request.actor_id)
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalWorkflow>> {
    let workflow = state.engine.get_workflow(&WorkflowId::new(id)).await?;
    Ok(Json(workflow))
}

/// Store a new version of a workflow
pub async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<WorkflowRequest>,
) -> ApiResult<Json<ApprovalWorkflow>> {
    let workflow = state
        .engine
        .update_workflow(&WorkflowId::new(id), request.workflow, &request.actor_id)
        .await?;
    Ok(Json(workflow))
}

pub async fn list_workflow_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ApprovalWorkflow>>> {
    let versions = state
        .engine
        .list_workflow_versions(&WorkflowId::new(id))
        .await?;
    Ok(Json(versions))
}

pub async fn get_workflow_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> ApiResult<Json<ApprovalWorkflow>> {
    let workflow = state
        .engine
        .get_workflow_version(&WorkflowId::new(id), version)
        .await?;
    Ok(Json(workflow))
}
