//! Approval instance handlers

use crate::api::rest::state::AppState;
use crate::error::{ApiError, ApiResult};
use approval_storage::{AuditRecord, QueryWindow};
use approval_types::{
    ApprovalInstance, Decision, InstanceId, InstanceView, RecordRef, StartedApproval, UserId,
    WorkflowId,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

/// Start approval request
#[derive(Debug, Deserialize)]
pub struct StartApprovalRequest {
    pub workflow_id: WorkflowId,
    pub record_table: String,
    pub record_id: String,
    pub requested_by: UserId,
}

pub async fn start_approval(
    State(state): State<AppState>,
    Json(request): Json<StartApprovalRequest>,
) -> ApiResult<(StatusCode, Json<StartedApproval>)> {
    let record = RecordRef::new(request.record_table, request.record_id);
    let started = state
        .engine
        .start_approval(&request.workflow_id, record, &request.requested_by)
        .await?;
    Ok((StatusCode::CREATED, Json(started)))
}

/// Instance listing filter; both record fields or neither
#[derive(Debug, Default, Deserialize)]
pub struct InstanceQuery {
    pub record_table: Option<String>,
    pub record_id: Option<String>,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstanceQuery>,
) -> ApiResult<Json<Vec<ApprovalInstance>>> {
    let instances = match (query.record_table, query.record_id) {
        (Some(table), Some(id)) => {
            state
                .engine
                .list_instances_for_record(&RecordRef::new(table, id))
                .await?
        }
        (None, None) => {
            state
                .engine
                .list_instances(QueryWindow::new(query.limit, query.offset))
                .await?
        }
        _ => {
            return Err(ApiError::BadRequest(
                "record_table and record_id must be given together".to_string(),
            ))
        }
    };
    Ok(Json(instances))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    Ok(Json(state.engine.get_instance(&InstanceId::new(id)).await?))
}

/// Approve/reject request
#[derive(Debug, Deserialize)]
pub struct ActRequest {
    pub actor_id: UserId,
    pub decision: Decision,
    #[serde(default)]
    pub comment: Option<String>,
}

pub async fn act_on_step(
    State(state): State<AppState>,
    Path((id, step)): Path<(String, u32)>,
    Json(request): Json<ActRequest>,
) -> ApiResult<Json<InstanceView>> {
    let view = state
        .engine
        .act(
            &InstanceId::new(id),
            step,
            &request.actor_id,
            request.decision,
            request.comment,
        )
        .await?;
    Ok(Json(view))
}

/// Delegation request
#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub from_user: UserId,
    pub to_user: UserId,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn delegate_step(
    State(state): State<AppState>,
    Path((id, step)): Path<(String, u32)>,
    Json(request): Json<DelegateRequest>,
) -> ApiResult<Json<InstanceView>> {
    let view = state
        .engine
        .delegate(
            &InstanceId::new(id),
            step,
            &request.from_user,
            &request.to_user,
            request.reason,
        )
        .await?;
    Ok(Json(view))
}

/// Manual escalation request
#[derive(Debug, Default, Deserialize)]
pub struct EscalateRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn escalate_step(
    State(state): State<AppState>,
    Path((id, step)): Path<(String, u32)>,
    Json(request): Json<EscalateRequest>,
) -> ApiResult<Json<InstanceView>> {
    let view = state
        .engine
        .escalate(&InstanceId::new(id), step, request.reason)
        .await?;
    Ok(Json(view))
}

/// Cancellation request
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub actor_id: UserId,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<InstanceView>> {
    let view = state
        .engine
        .cancel_approval(&InstanceId::new(id), &request.actor_id, request.reason)
        .await?;
    Ok(Json(view))
}

/// Compliance log entries of one instance, oldest first
pub async fn instance_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<AuditRecord>>> {
    let id = InstanceId::new(id);
    // 404 for unknown instances rather than an empty list
    state.engine.get_instance(&id).await?;
    Ok(Json(state.engine.audit_for_instance(&id).await?))
}
