//! Compliance and escalation queries

use crate::api::rest::state::AppState;
use crate::error::ApiResult;
use approval_storage::{AuditRecord, QueryWindow};
use approval_types::EscalationCandidate;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Paging for the audit log
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_audit_limit() -> usize {
    100
}

/// Global audit log, newest first
pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditRecord>>> {
    let records = state
        .engine
        .audit_log(QueryWindow::new(query.limit, query.offset))
        .await?;
    Ok(Json(records))
}

#[derive(Debug, Default, Deserialize)]
pub struct DueQuery {
    /// Evaluate as of this instant instead of now
    pub at: Option<DateTime<Utc>>,
}

/// Steps past their escalation timeout
pub async fn list_due_escalations(
    State(state): State<AppState>,
    Query(query): Query<DueQuery>,
) -> ApiResult<Json<Vec<EscalationCandidate>>> {
    let now = query.at.unwrap_or_else(Utc::now);
    Ok(Json(state.engine.due_for_escalation(now).await?))
}
