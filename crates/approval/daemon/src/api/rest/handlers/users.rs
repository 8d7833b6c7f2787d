//! Per-user approval views

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use approval_engine::EffectiveAccess;
use approval_types::{InstanceView, UserId};
use axum::{
    extract::{Path, State},
    Json,
};

/// Approvals waiting on a user
pub async fn list_pending(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<InstanceView>>> {
    let pending = state.engine.list_pending_for(&UserId::new(id)).await?;
    Ok(Json(pending))
}

/// Effective roles and permissions of a user
pub async fn get_permissions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EffectiveAccess>> {
    let access = state.engine.effective_access(&UserId::new(id)).await?;
    Ok(Json(access))
}
