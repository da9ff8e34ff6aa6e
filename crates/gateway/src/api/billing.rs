//! Billing endpoints: token status, usage history, BYOK key management.

use axum::extract::{Query, State};
use axum::response::Json;
use axum::Extension;
use kiln_domain::Error;
use serde::Deserialize;

use crate::api::auth::AuthUser;
use crate::api::error::ApiResult;
use crate::state::AppState;

pub async fn token_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.ledger.token_status(&user.account_id).await?;
    Ok(Json(serde_json::to_value(&status)?))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default = "default_days")]
    pub days: i64,
}

fn default_days() -> i64 {
    30
}

pub async fn usage_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<UsageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let days = query.days.clamp(1, 365);
    let usage = state.ledger.usage_history(&user.account_id, days).await?;
    Ok(Json(serde_json::json!({ "usage": usage, "days": days })))
}

#[derive(Debug, Deserialize)]
pub struct ByokKeyRequest {
    pub api_key: String,
}

/// Store the caller's upstream LLM key (encrypted at rest). Replaces any
/// previously stored key for the provider.
pub async fn store_byok_key(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ByokKeyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let api_key = body.api_key.trim();
    if api_key.is_empty() {
        return Err(Error::ClientInput("api_key must not be empty".into()).into());
    }
    let key_id = state.keys.store_user_key(&user.account_id, api_key).await?;
    Ok(Json(serde_json::json!({
        "key_id": key_id,
        "provider": crate::runtime::keys::LLM_PROVIDER,
        "active": true,
    })))
}
