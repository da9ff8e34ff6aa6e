pub mod admin;
pub mod agent;
pub mod auth;
pub mod billing;
pub mod error;
pub mod projects;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, post, put};
use axum::Router;

use crate::state::AppState;

/// Multipart uploads carry image attachments up to 10 MB each.
const BODY_LIMIT: usize = 25 * 1024 * 1024;

/// Build the full API router.
///
/// Routes split three ways: **public** (health, plus the SSE stream,
/// which authenticates inside the handler so query tokens work),
/// **protected** (bearer-token middleware), and **admin** (admin-key
/// middleware).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/health", get(admin::health))
        // SSE: EventSource cannot send headers, so auth happens in the
        // handler (header or ?token=).
        .route("/agent-run/:run_id/stream", get(agent::stream_run));

    let protected = Router::new()
        .route("/agent/initiate", post(agent::initiate))
        .route("/thread/:thread_id/agent/start", post(agent::start))
        .route("/thread/:thread_id/agent-runs", get(agent::list_runs))
        .route("/agent-run/:run_id", get(agent::get_run))
        .route("/agent-run/:run_id/status", get(agent::get_status))
        .route("/agent-run/:run_id/stop", post(agent::stop))
        .route("/projects", get(projects::list_projects))
        .route("/projects/:project_id", get(projects::get_project))
        .route("/projects/:project_id", delete(projects::delete_project))
        .route("/threads", get(projects::list_threads))
        .route("/billing/status", get(billing::token_status))
        .route("/billing/usage", get(billing::usage_history))
        .route("/billing/byok-key", put(billing::store_byok_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    let admin_routes = Router::new()
        .route("/admin/pool", get(admin::pool_status))
        .route("/admin/locks", get(admin::lock_metrics))
        .route(
            "/admin/accounts/:account_id/reset-quota",
            post(admin::reset_quota),
        )
        .route("/admin/accounts/:account_id/plan", put(admin::set_plan))
        .route_layer(middleware::from_fn_with_state(state, auth::require_admin));

    public
        .merge(protected)
        .merge(admin_routes)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
