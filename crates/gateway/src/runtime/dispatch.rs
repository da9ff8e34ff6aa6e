//! The run dispatcher: the synchronous edge that turns a start or stop
//! request into a durable run record plus an asynchronous work item.

use std::time::Duration;

use kiln_coordination::{keys, status, CoordStore, JobQueue, RunJob, SetMode, DEFAULT_TTL};
use kiln_domain::entities::{Project, Thread};
use kiln_domain::plans::resolve_model_alias;
use kiln_domain::run::{AgentRun, RunMetadata, RunStatus};
use kiln_domain::stream::ControlSignal;
use kiln_domain::{Error, Result};
use kiln_sandbox::lifecycle::{ensure_running, ReadinessPolicy};
use kiln_store::Database;
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

/// How long a new start waits for the project's previous run to honor
/// its STOP before giving up.
const OVERLAP_WAIT: Duration = Duration::from_secs(10);
const OVERLAP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartParams {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub enable_context_manager: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct StartedRun {
    pub agent_run_id: Uuid,
}

/// Start an agent run on a thread.
///
/// Order matters: authorization, then model gating, then the quota
/// precheck, then the project-overlap check, then sandbox readiness —
/// only once all of those pass is a run row persisted and a work item
/// enqueued.
pub async fn start_run(
    state: &AppState,
    thread_id: Uuid,
    params: StartParams,
    account_id: &str,
) -> Result<StartedRun> {
    let (thread, project) = authorized_thread(state, thread_id, account_id).await?;

    let model = resolve_model_alias(
        params
            .model_name
            .as_deref()
            .unwrap_or(&state.config.default_model),
    )
    .to_owned();
    state
        .ledger
        .ensure_model_allowed(&thread.account_id, &model, &state.config.default_model)
        .await?;

    state.ledger.precheck_conversation(&thread.account_id).await?;

    stop_overlapping_run(state, &project).await?;

    let sandbox = project
        .sandbox
        .as_ref()
        .ok_or_else(|| Error::NotFound(format!("no sandbox found for project {}", project.project_id)))?;
    ensure_running(
        state.pool.provider().as_ref(),
        &state.locks,
        &state.instance_id,
        &sandbox.id,
        &ReadinessPolicy::default(),
    )
    .await
    .map_err(|e| Error::Internal(format!("failed to initialize sandbox: {e}")))?;

    let run = AgentRun::new(
        thread_id,
        RunMetadata {
            model: model.clone(),
            enable_thinking: params.enable_thinking,
            reasoning_effort: params.reasoning_effort.clone(),
            enable_context_manager: params.enable_context_manager,
        },
    );
    let run_id = run.run_id;
    state.db.insert_run(run).await?;
    tracing::info!(%run_id, %thread_id, model, "created agent run");

    // Liveness marker; best-effort.
    if let Err(e) = state
        .coord
        .set(
            &keys::active_run(&state.instance_id, run_id),
            "running",
            DEFAULT_TTL,
            SetMode::Always,
        )
        .await
    {
        tracing::warn!(%run_id, error = %e, "failed to register active-run marker");
    }

    let job = RunJob {
        run_id,
        thread_id,
        instance_id: state.instance_id.clone(),
        project_id: project.project_id,
        model,
        enable_thinking: params.enable_thinking,
        reasoning_effort: params.reasoning_effort,
        stream: params.stream,
        enable_context_manager: params.enable_context_manager,
        is_agent_builder: thread.metadata.is_agent_builder,
        target_agent_id: thread.metadata.target_agent_id.clone(),
        request_id: Uuid::new_v4().to_string(),
        app_type: project.app_type,
    };

    if let Err(e) = state.queue.enqueue(job).await {
        tracing::error!(%run_id, error = %e, "failed to enqueue run");
        let _ = state
            .db
            .update_run_status(
                run_id,
                RunStatus::Failed,
                Some(format!("failed to queue background task: {e}")),
                None,
            )
            .await;
        return Err(Error::Internal(format!("failed to queue background task: {e}")));
    }

    Ok(StartedRun { agent_run_id: run_id })
}

/// Only one run may be active per project. A live predecessor gets a
/// STOP and this call waits (bounded) for it to leave `{queued,
/// running}` before the new run proceeds.
async fn stop_overlapping_run(state: &AppState, project: &Project) -> Result<()> {
    let Some(active_id) = state.db.active_run_for_project(project.project_id).await? else {
        return Ok(());
    };
    tracing::info!(
        project_id = %project.project_id,
        stopping = %active_id,
        "stopping previous agent run for project"
    );
    state
        .coord
        .publish(&keys::run_control(active_id), ControlSignal::Stop.as_wire())
        .await?;
    state
        .db
        .update_run_status(active_id, RunStatus::Stopping, None, None)
        .await?;

    let deadline = tokio::time::Instant::now() + OVERLAP_WAIT;
    loop {
        if state.db.active_run_for_project(project.project_id).await?.is_none() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Conflict(format!(
                "previous run {active_id} did not stop in time"
            )));
        }
        tokio::time::sleep(OVERLAP_POLL).await;
    }
}

/// Request a graceful stop. Terminal runs are a no-op; the durable row
/// moves to `stopping` and the executor writes the terminal `stopped`.
pub async fn stop_run(state: &AppState, run_id: Uuid, account_id: &str) -> Result<RunStatus> {
    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("agent run {run_id}")))?;
    authorized_thread(state, run.thread_id, account_id).await?;

    if run.status.is_terminal() {
        return Ok(run.status);
    }

    state
        .coord
        .publish(&keys::run_control(run_id), ControlSignal::Stop.as_wire())
        .await?;
    if run.status.is_active() {
        state
            .db
            .update_run_status(run_id, RunStatus::Stopping, None, None)
            .await?;
    }
    tracing::info!(%run_id, "sent STOP signal");
    Ok(RunStatus::Stopping)
}

/// Durable status, with the transient task-status record preferred for
/// liveness when one exists.
pub async fn run_status(
    state: &AppState,
    run_id: Uuid,
    account_id: &str,
) -> Result<serde_json::Value> {
    let run = state
        .db
        .get_run(run_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("agent run {run_id}")))?;
    authorized_thread(state, run.thread_id, account_id).await?;

    let mut status = run.status.as_str().to_owned();
    let mut transient = None;
    if let Some(task) = status::read_task_status(state.coord.as_ref(), run_id).await {
        status = task.status.clone();
        transient = Some(task);
    }

    Ok(serde_json::json!({
        "agent_run_id": run.run_id,
        "thread_id": run.thread_id,
        "status": status,
        "started_at": run.started_at,
        "completed_at": run.completed_at,
        "error": run.error,
        "transient": transient,
    }))
}

/// Load the thread and its project, enforcing that the caller owns the
/// project or it is public.
pub async fn authorized_thread(
    state: &AppState,
    thread_id: Uuid,
    account_id: &str,
) -> Result<(Thread, Project)> {
    let thread = state
        .db
        .get_thread(thread_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("thread {thread_id}")))?;
    let project = state
        .db
        .get_project(thread.project_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {}", thread.project_id)))?;
    if project.account_id != account_id && !project.is_public {
        return Err(Error::Forbidden("no access to this project".into()));
    }
    Ok((thread, project))
}
