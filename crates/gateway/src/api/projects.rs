//! Project and thread listings.

use axum::extract::{Path, State};
use axum::response::Json;
use axum::Extension;
use kiln_domain::Error;
use kiln_store::Database;
use uuid::Uuid;

use crate::api::auth::AuthUser;
use crate::api::error::ApiResult;
use crate::state::AppState;

pub async fn list_projects(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let projects = state.db.list_projects(&user.account_id).await?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

pub async fn get_project(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
    if project.account_id != user.account_id && !project.is_public {
        return Err(Error::Forbidden("no access to this project".into()).into());
    }
    Ok(Json(serde_json::to_value(&project)?))
}

/// Delete a project (cascades to threads, messages, and runs) and
/// release the owner's sandbox back to the pool.
pub async fn delete_project(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = state
        .db
        .get_project(project_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
    if project.account_id != user.account_id {
        return Err(Error::Forbidden("only the owner may delete a project".into()).into());
    }

    state.db.delete_project(project_id).await?;
    state.pool.release_sandbox(&user.account_id, true).await?;
    Ok(Json(serde_json::json!({ "deleted": project_id })))
}

pub async fn list_threads(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let threads = state.db.list_threads(&user.account_id).await?;
    Ok(Json(serde_json::json!({ "threads": threads })))
}
