//! Agent run endpoints: initiate, start, stop, status, stream.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use axum::Extension;
use kiln_domain::entities::{
    AppType, Message, MessageKind, Project, SandboxDescriptor, Thread,
};
use kiln_domain::Error;
use kiln_sandbox::FilesystemOps;
use kiln_store::Database;
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::{self, AuthUser};
use crate::api::error::{ApiError, ApiResult};
use crate::runtime::dispatch::{self, StartParams};
use crate::runtime::stream;
use crate::state::AppState;

const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
const ALLOWED_IMAGE_TYPES: [&str; 5] = [
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/gif",
    "image/webp",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /agent/initiate (multipart)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create project + sandbox + thread from a first prompt (plus optional
/// image attachments) and enqueue the first run. The quota gate runs
/// before anything is created, so an underfunded request leaves no rows
/// behind.
pub async fn initiate(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut prompt = String::new();
    let mut app_type = AppType::Web;
    let mut model_name: Option<String> = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::ClientInput(format!("invalid multipart payload: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_owned();
        match field_name.as_str() {
            "prompt" => {
                prompt = field
                    .text()
                    .await
                    .map_err(|e| Error::ClientInput(format!("unreadable prompt field: {e}")))?;
            }
            "app_type" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::ClientInput(format!("unreadable app_type field: {e}")))?;
                app_type = AppType::parse_lenient(&value);
            }
            "model_name" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::ClientInput(format!("unreadable model_name field: {e}")))?;
                if !value.is_empty() {
                    model_name = Some(value);
                }
            }
            "files" | "images" => {
                let name = sanitize_filename(field.file_name().unwrap_or("upload"));
                let content_type = field.content_type().unwrap_or("").to_owned();
                if !ALLOWED_IMAGE_TYPES.contains(&content_type.as_str()) {
                    return Err(Error::ClientInput(format!(
                        "unsupported file type: {content_type}"
                    ))
                    .into());
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| Error::ClientInput(format!("unreadable file upload: {e}")))?;
                if data.is_empty() {
                    return Err(Error::ClientInput(format!("file {name} is empty")).into());
                }
                if data.len() > MAX_IMAGE_BYTES {
                    return Err(Error::ClientInput(format!(
                        "file {name} exceeds the {MAX_IMAGE_BYTES} byte limit"
                    ))
                    .into());
                }
                files.push((name, data.to_vec()));
            }
            other => {
                tracing::debug!(field = other, "ignoring unknown multipart field");
            }
        }
    }

    let prompt = prompt.trim().to_owned();
    if prompt.is_empty() {
        return Err(Error::ClientInput("prompt must not be empty".into()).into());
    }

    // Quota gate before any resource exists.
    state.ledger.precheck_conversation(&user.account_id).await?;

    let project = Project::new(&user.account_id, "New Project", app_type);
    let project_id = project.project_id;
    state.db.insert_project(project).await?;

    let sandbox = match state
        .pool
        .get_sandbox_for_user(&user.account_id, &project_id.to_string(), app_type)
        .await
    {
        Ok(sandbox) => sandbox,
        Err(e) => {
            // Don't leave a sandbox-less project behind.
            let _ = state.db.delete_project(project_id).await;
            return Err(e.into());
        }
    };
    state
        .db
        .set_project_sandbox(
            project_id,
            SandboxDescriptor {
                id: sandbox.id.clone(),
                preview_url: sandbox.preview_url.clone(),
            },
        )
        .await?;

    let thread = Thread::new(project_id, &user.account_id);
    let thread_id = thread.thread_id;
    state.db.insert_thread(thread).await?;

    // Stage attachments in the sandbox workspace; failures degrade to a
    // prompt without them.
    let mut attachments = Vec::new();
    let fs = state.pool.provider().filesystem(&sandbox.id);
    for (name, data) in &files {
        let path = format!("/workspace/uploads/{name}");
        match fs.upload_file(&path, data).await {
            Ok(()) => attachments.push(path),
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox.id, file = name, error = %e, "attachment upload failed");
            }
        }
    }

    state
        .db
        .insert_message(Message::new(
            thread_id,
            MessageKind::User,
            serde_json::json!({ "text": prompt, "attachments": attachments }),
        ))
        .await?;

    let started = dispatch::start_run(
        &state,
        thread_id,
        StartParams {
            model_name,
            enable_thinking: false,
            reasoning_effort: None,
            stream: true,
            enable_context_manager: false,
        },
        &user.account_id,
    )
    .await?;

    // Name the project in the background so the response stays fast.
    let db = state.db.clone();
    let name = derive_project_name(&prompt);
    tokio::spawn(async move {
        if let Err(e) = db.set_project_name(project_id, &name).await {
            tracing::warn!(%project_id, error = %e, "failed to name project");
        }
    });

    Ok(Json(serde_json::json!({
        "thread_id": thread_id,
        "agent_run_id": started.agent_run_id,
        "project_id": project_id,
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /thread/:thread_id/agent/start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(thread_id): Path<Uuid>,
    payload: Option<Json<StartParams>>,
) -> ApiResult<Json<serde_json::Value>> {
    let params = payload.map(|Json(p)| p).unwrap_or_default();
    let started = dispatch::start_run(&state, thread_id, params, &user.account_id).await?;
    Ok(Json(serde_json::json!({
        "agent_run_id": started.agent_run_id,
        "status": "queued",
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /agent-run/:run_id/stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn stop(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = dispatch::stop_run(&state, run_id, &user.account_id).await?;
    Ok(Json(serde_json::json!({
        "message": "Stop signal sent",
        "agent_run_id": run_id,
        "status": status.as_str(),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent-run/:run_id and /agent-run/:run_id/status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_run(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("agent run {run_id}")))?;
    dispatch::authorized_thread(&state, run.thread_id, &user.account_id).await?;
    Ok(Json(serde_json::to_value(&run)?))
}

pub async fn get_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(
        dispatch::run_status(&state, run_id, &user.account_id).await?,
    ))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /thread/:thread_id/agent-runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_runs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(thread_id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    dispatch::authorized_thread(&state, thread_id, &user.account_id).await?;
    let runs = state.db.list_runs_for_thread(thread_id).await?;
    // Lightweight list view: drop the response snapshots.
    let items: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "run_id": r.run_id,
                "thread_id": r.thread_id,
                "status": r.status,
                "started_at": r.started_at,
                "completed_at": r.completed_at,
                "error": r.error,
                "model": r.metadata.model,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "agent_runs": items })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /agent-run/:run_id/stream (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// SSE endpoint. Authenticates from the Authorization header or the
/// `?token=` query parameter (EventSource cannot send headers).
pub async fn stream_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Response {
    let user = match auth::user_from_parts(&state, &headers, query.token.as_deref()) {
        Ok(user) => user,
        Err(e) => return ApiError(e).into_response(),
    };

    let run = match state.db.get_run(run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            return ApiError(Error::NotFound(format!("agent run {run_id}"))).into_response()
        }
        Err(e) => return ApiError(e).into_response(),
    };
    if let Err(e) = dispatch::authorized_thread(&state, run.thread_id, &user.account_id).await {
        return ApiError(e).into_response();
    }

    tracing::info!(%run_id, account_id = %user.account_id, "starting SSE stream");
    stream::sse_response(state, run_id)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "upload".to_owned()
    } else {
        cleaned
    }
}

/// Placeholder name until the background task fills in a better one.
fn derive_project_name(prompt: &str) -> String {
    let words: Vec<&str> = prompt.split_whitespace().take(4).collect();
    if words.is_empty() {
        return "New Project".to_owned();
    }
    let mut name = words
        .iter()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    if name.len() > 50 {
        let mut end = 50;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("photo.png"), "photo.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("my file (1).png"), "my_file__1_.png");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir\\evil.png"), "evil.png");
    }

    #[test]
    fn project_names_from_prompts() {
        assert_eq!(
            derive_project_name("build a hello world page"),
            "Build A Hello World"
        );
        assert_eq!(derive_project_name("todo app"), "Todo App");
        assert_eq!(derive_project_name("   "), "New Project");
        let long = derive_project_name(
            "supercalifragilisticexpialidocious extraordinarily verbose prompt words",
        );
        assert!(long.len() <= 50);
    }
}
