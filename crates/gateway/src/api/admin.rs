//! Health probe and admin surface: pool status, lock metrics, quota
//! management.

use axum::extract::{Path, State};
use axum::response::Json;
use kiln_domain::plans::PlanId;
use kiln_domain::Error;
use serde::Deserialize;

use crate::api::error::ApiResult;
use crate::state::AppState;

/// Public liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "instance_id": state.instance_id,
        "timestamp": chrono::Utc::now(),
    }))
}

/// Sandbox pool status and utilization (admin).
pub async fn pool_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.pool.status()))
}

/// Distributed-lock activity: held locks, long-held warnings, potential
/// deadlocks (admin).
pub async fn lock_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(state.locks.monitor().metrics()))
}

/// Restore an account's balance to its plan total (admin).
pub async fn reset_quota(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.ledger.reset_quota(&account_id).await? {
        return Err(Error::NotFound(format!("billing account {account_id}")).into());
    }
    tracing::info!(account_id, "quota reset by admin");
    Ok(Json(serde_json::json!({ "account_id": account_id, "reset": true })))
}

#[derive(Debug, Deserialize)]
pub struct SetPlanRequest {
    pub plan_id: String,
}

/// Move an account to a different plan, resetting both quota totals
/// (admin).
pub async fn set_plan(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<SetPlanRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let plan = PlanId::parse(&body.plan_id)
        .ok_or_else(|| Error::ClientInput(format!("unknown plan: {}", body.plan_id)))?;
    let status = state.ledger.change_plan(&account_id, plan).await?;
    tracing::info!(account_id, plan = plan.as_str(), "plan changed by admin");
    Ok(Json(serde_json::to_value(&status)?))
}
