//! The run executor.
//!
//! Consumes one queued run: acquires execution ownership, listens for
//! STOP signals, drives the agent engine's stream into the per-run
//! response log, finalizes the durable row, and cleans up transient
//! state. Cleanup always runs and its errors never surface as run
//! failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kiln_coordination::{keys, status, CoordStore, LockAttempt, RunJob, SetMode, DEFAULT_TTL};
use kiln_domain::run::RunStatus;
use kiln_domain::stream::{AgentEngine, ControlSignal, EngineContext, StreamItem, StreamStatus};
use kiln_domain::{Error, Result};
use kiln_store::Database;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::runtime::item_terminal_status;
use crate::state::AppState;

/// Refresh the liveness marker every this many stream items.
const ACTIVE_TTL_REFRESH_EVERY: u64 = 50;
/// Response lists stay replayable for a day after the run ends.
const RESPONSE_LIST_TTL: Duration = Duration::from_secs(24 * 3600);
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const CLEANUP_BUDGET: Duration = Duration::from_secs(30);
const CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Execute one queued run end to end. Never panics the worker; every
/// failure path finalizes the run row and runs cleanup.
pub async fn execute_run(state: AppState, job: RunJob) {
    let run_id = job.run_id;

    // ── Phase 1: acquire execution ownership ────────────────────────
    let lock_key = keys::run_lock(run_id);
    match state
        .locks
        .acquire_or_reclaim(&lock_key, &state.instance_id, "agent_run_execution", DEFAULT_TTL)
        .await
    {
        Ok(LockAttempt::Acquired) => {}
        Ok(LockAttempt::Reclaimed) => {
            tracing::warn!(%run_id, "executing run under a reclaimed lock");
        }
        Ok(LockAttempt::Held) => {
            // Duplicate delivery; another instance owns this run.
            tracing::info!(%run_id, "run is owned by another instance, skipping");
            return;
        }
        Err(e) => {
            tracing::error!(%run_id, error = %e, "failed to acquire run lock");
            return;
        }
    }

    // Redelivery guard: a work item may arrive again after the run
    // already finished. Observe the terminal row and exit without side
    // effect.
    match state.db.get_run(run_id).await {
        Ok(Some(run)) if !run.status.is_terminal() => {}
        Ok(Some(run)) => {
            tracing::info!(%run_id, status = run.status.as_str(), "run already terminal, skipping");
            let _ = state.locks.release(&lock_key, &state.instance_id).await;
            return;
        }
        Ok(None) => {
            tracing::warn!(%run_id, "queued run has no durable row, skipping");
            let _ = state.locks.release(&lock_key, &state.instance_id).await;
            return;
        }
        Err(e) => {
            tracing::error!(%run_id, error = %e, "failed to load run row");
            let _ = state.locks.release(&lock_key, &state.instance_id).await;
            return;
        }
    }

    // ── Phase 2: subscribe to control ───────────────────────────────
    let stop_requested = Arc::new(AtomicBool::new(false));
    let listener = spawn_control_listener(&state, run_id, stop_requested.clone());

    // ── Phase 3: drive the agent generator ──────────────────────────
    let outcome = drive(&state, &job, &stop_requested).await;
    let (final_status, error_message) = match outcome {
        Ok((status, error)) => (status, error),
        Err(e) => {
            tracing::error!(%run_id, error = %e, "agent run failed");
            // Best-effort error item so subscribers see the failure in
            // the log itself.
            let item = StreamItem::status(StreamStatus::Failed, Some(e.to_string()));
            if let Ok(raw) = serde_json::to_string(&item) {
                let _ = state
                    .coord
                    .list_push(&keys::run_responses(run_id), &raw, DEFAULT_TTL)
                    .await;
                let _ = state
                    .coord
                    .publish(&keys::run_new_response(run_id), keys::RESPONSE_NOTIFY)
                    .await;
            }
            (RunStatus::Failed, Some(e.to_string()))
        }
    };

    // ── Phase 4: finalize ───────────────────────────────────────────
    finalize(&state, run_id, final_status, error_message).await;

    // ── Phase 5: cleanup (always) ───────────────────────────────────
    cleanup(&state, run_id, listener).await;
    tracing::info!(
        %run_id,
        final_status = final_status.as_str(),
        "agent run fully completed"
    );
}

/// Long-lived task whose only job is to flip the shared stop flag when
/// a STOP arrives on either control channel.
fn spawn_control_listener(
    state: &AppState,
    run_id: Uuid,
    stop_requested: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let mut global = state.coord.subscribe(&keys::run_control(run_id));
    let mut targeted = state
        .coord
        .subscribe(&keys::run_control_for_instance(run_id, &state.instance_id));
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                m = global.recv() => m,
                m = targeted.recv() => m,
            };
            match message.as_deref() {
                Some("STOP") => {
                    tracing::info!(%run_id, "received STOP signal");
                    stop_requested.store(true, Ordering::Release);
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
    })
}

/// Pump the engine stream into the response log until a terminal
/// condition. Returns the final status and optional error text.
async fn drive(
    state: &AppState,
    job: &RunJob,
    stop_requested: &AtomicBool,
) -> Result<(RunStatus, Option<String>)> {
    let run_id = job.run_id;
    let responses_key = keys::run_responses(run_id);
    let notify_channel = keys::run_new_response(run_id);
    let active_key = keys::active_run(&state.instance_id, run_id);

    status::write_task_status(state.coord.as_ref(), run_id, "running", None).await?;
    state
        .coord
        .set(&active_key, "running", DEFAULT_TTL, SetMode::Always)
        .await?;

    let messages = state.db.list_messages(job.thread_id).await?;
    let mut stream = state.engine.run(EngineContext {
        run_id,
        thread_id: job.thread_id,
        project_id: job.project_id,
        account_id: account_for(state, job).await?,
        model: job.model.clone(),
        enable_thinking: job.enable_thinking,
        reasoning_effort: job.reasoning_effort.clone(),
        enable_context_manager: job.enable_context_manager,
        app_type: job.app_type,
        messages,
    });

    let mut total: u64 = 0;
    while let Some(item) = stream.next().await {
        if stop_requested.load(Ordering::Acquire) {
            tracing::info!(%run_id, "run stopped by signal");
            return Ok((RunStatus::Stopped, None));
        }

        let raw = serde_json::to_string(&item)?;
        state
            .coord
            .list_push(&responses_key, &raw, DEFAULT_TTL)
            .await?;
        state
            .coord
            .publish(&notify_channel, keys::RESPONSE_NOTIFY)
            .await?;
        total += 1;

        if total % ACTIVE_TTL_REFRESH_EVERY == 0 {
            if let Err(e) = state.coord.expire(&active_key, DEFAULT_TTL).await {
                tracing::warn!(%run_id, error = %e, "failed to refresh liveness marker");
            }
        }

        if let Some(terminal) = item.terminal_status() {
            let message = match &item {
                StreamItem::Status { message, .. } => message.clone(),
                _ => None,
            };
            let final_status = match terminal {
                StreamStatus::Completed => RunStatus::Completed,
                StreamStatus::Failed => RunStatus::Failed,
                StreamStatus::Stopped => RunStatus::Stopped,
                _ => unreachable!("terminal_status only yields terminal values"),
            };
            tracing::info!(
                %run_id,
                status = final_status.as_str(),
                responses = total,
                "run finished via status message"
            );
            let error = if final_status == RunStatus::Completed {
                None
            } else {
                message.or_else(|| Some(format!("run ended with status: {}", final_status.as_str())))
            };
            return Ok((final_status, error));
        }
    }

    // Generator exhausted with no terminal status: synthesize one.
    if stop_requested.load(Ordering::Acquire) {
        return Ok((RunStatus::Stopped, None));
    }
    let completion = StreamItem::status(
        StreamStatus::Completed,
        Some("Agent run completed successfully".to_string()),
    );
    state
        .coord
        .list_push(&responses_key, &serde_json::to_string(&completion)?, DEFAULT_TTL)
        .await?;
    state
        .coord
        .publish(&notify_channel, keys::RESPONSE_NOTIFY)
        .await?;
    tracing::info!(%run_id, responses = total, "run completed normally");
    Ok((RunStatus::Completed, None))
}

async fn account_for(state: &AppState, job: &RunJob) -> Result<String> {
    Ok(state
        .db
        .get_thread(job.thread_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("thread {}", job.thread_id)))?
        .account_id)
}

/// Write the durable outcome, guarantee the response log ends with a
/// terminal status item, publish the final control signal, and mirror
/// the transient status record.
async fn finalize(
    state: &AppState,
    run_id: Uuid,
    final_status: RunStatus,
    error: Option<String>,
) {
    let responses_key = keys::run_responses(run_id);

    // The log must end terminally for replay consumers; the stopped
    // path produces no item of its own.
    if let Ok(items) = state.coord.list_range(&responses_key, -1, -1).await {
        let last_is_terminal = items
            .last()
            .and_then(|raw| item_terminal_status(raw))
            .is_some();
        if !last_is_terminal {
            let stream_status = match final_status {
                RunStatus::Completed => StreamStatus::Completed,
                RunStatus::Failed => StreamStatus::Failed,
                _ => StreamStatus::Stopped,
            };
            let item = StreamItem::status(stream_status, error.clone());
            if let Ok(raw) = serde_json::to_string(&item) {
                let _ = state.coord.list_push(&responses_key, &raw, DEFAULT_TTL).await;
                let _ = state
                    .coord
                    .publish(&keys::run_new_response(run_id), keys::RESPONSE_NOTIFY)
                    .await;
            }
        }
    }

    // Snapshot the full log into the durable row.
    let snapshot: Vec<serde_json::Value> = state
        .coord
        .list_range(&responses_key, 0, -1)
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|raw| serde_json::from_str(raw).ok())
        .collect();

    // The durable update is retried; a run row stuck in `running` past
    // worker exit is what the stale-lock path has to mop up.
    let mut backoff = Duration::from_millis(500);
    for attempt in 0..3 {
        match state
            .db
            .update_run_status(run_id, final_status, error.clone(), Some(snapshot.clone()))
            .await
        {
            Ok(true) => break,
            Ok(false) => {
                tracing::warn!(
                    %run_id,
                    status = final_status.as_str(),
                    "run row refused status transition (already terminal?)"
                );
                break;
            }
            Err(e) if attempt < 2 => {
                tracing::error!(%run_id, attempt, error = %e, "failed to update run row, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "failed to update run row after retries");
            }
        }
    }

    let signal = match final_status {
        RunStatus::Completed => ControlSignal::EndStream,
        RunStatus::Failed => ControlSignal::Error,
        _ => ControlSignal::Stop,
    };
    if let Err(e) = state
        .coord
        .publish(&keys::run_control(run_id), signal.as_wire())
        .await
    {
        tracing::warn!(%run_id, signal = signal.as_wire(), error = %e, "failed to publish final control signal");
    }

    let data = error.map(|e| serde_json::json!({ "error": e }));
    if let Err(e) =
        status::write_task_status(state.coord.as_ref(), run_id, final_status.as_str(), data).await
    {
        tracing::warn!(%run_id, error = %e, "failed to write final task status");
    }
}

/// Tear down the control listener and transient keys. Errors are
/// isolated, logged, and never propagated.
async fn cleanup(state: &AppState, run_id: Uuid, listener: JoinHandle<()>) {
    listener.abort();
    if tokio::time::timeout(LISTENER_SHUTDOWN_TIMEOUT, listener)
        .await
        .is_err()
    {
        tracing::warn!(%run_id, "control listener did not shut down in time");
    }

    let responses_key = keys::run_responses(run_id);
    let active_key = keys::active_run(&state.instance_id, run_id);
    let lock_key = keys::run_lock(run_id);

    let actions = async {
        let (ttl, marker, lock) = tokio::join!(
            with_retries("response_list_ttl", || state
                .coord
                .expire(&responses_key, RESPONSE_LIST_TTL)),
            with_retries("active_marker_delete", || state.coord.delete(&active_key)),
            with_retries("run_lock_release", || state
                .locks
                .release(&lock_key, &state.instance_id)),
        );
        let mut errors = 0;
        for (label, result) in [
            ("response_list_ttl", ttl),
            ("active_marker_delete", marker),
            ("run_lock_release", lock),
        ] {
            if let Err(e) = result {
                errors += 1;
                tracing::warn!(%run_id, action = label, error = %e, "cleanup action failed");
            }
        }
        errors
    };

    match tokio::time::timeout(CLEANUP_BUDGET, actions).await {
        Ok(0) => tracing::debug!(%run_id, "cleanup completed"),
        Ok(errors) => tracing::warn!(%run_id, errors, "cleanup completed with errors"),
        Err(_) => tracing::warn!(%run_id, "cleanup timed out"),
    }
}

async fn with_retries<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..3 {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(label, attempt, error = %e, "cleanup action attempt failed");
                last = Some(e);
                if attempt < 2 {
                    tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::Internal(format!("{label} failed"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{self, TestHarness};
    use kiln_domain::run::RunStatus;

    #[tokio::test]
    async fn happy_path_appends_items_and_completes() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness
            .queued_run(testing::scripted_items(3, /* terminal */ true))
            .await;

        execute_run(harness.state.clone(), job).await;

        // Durable row is terminal with the response snapshot.
        let run = harness.state.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.completed_at.is_some());
        assert_eq!(run.responses.len(), 4); // 3 content + terminal status

        // The coordination log ends with a terminal status item.
        let raw = harness.responses(run_id).await;
        assert_eq!(raw.len(), 4);
        assert!(item_terminal_status(raw.last().unwrap()).is_some());

        // Lock and liveness marker are gone; list TTL was set.
        assert!(harness
            .state
            .coord
            .get(&keys::run_lock(run_id))
            .await
            .unwrap()
            .is_none());
        assert!(harness
            .state
            .coord
            .get(&keys::active_run(&harness.state.instance_id, run_id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn generator_exhaustion_synthesizes_completion() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness
            .queued_run(testing::scripted_items(2, /* terminal */ false))
            .await;

        execute_run(harness.state.clone(), job).await;

        let run = harness.state.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let raw = harness.responses(run_id).await;
        assert_eq!(raw.len(), 3); // 2 content + synthetic completion
        assert_eq!(
            item_terminal_status(raw.last().unwrap()),
            Some(StreamStatus::Completed)
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_executes_exactly_once() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness
            .queued_run(testing::scripted_items(3, true))
            .await;

        // The same work item delivered to two executors concurrently.
        let (a, b) = tokio::join!(
            execute_run(harness.state.clone(), job.clone()),
            execute_run(harness.state.clone(), job)
        );
        let _ = (a, b);

        // No duplicated items: exactly one execution appended.
        let raw = harness.responses(run_id).await;
        assert_eq!(raw.len(), 4);
        let run = harness.state.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn stop_signal_ends_run_as_stopped() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness.queued_run(testing::endless_items()).await;

        let exec = tokio::spawn(execute_run(harness.state.clone(), job));

        // Let a few items flow, then stop.
        tokio::time::sleep(Duration::from_millis(60)).await;
        harness
            .state
            .coord
            .publish(&keys::run_control(run_id), "STOP")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), exec)
            .await
            .expect("executor honors stop")
            .unwrap();

        let run = harness.state.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Stopped);

        // The log still ends with a terminal status item.
        let raw = harness.responses(run_id).await;
        assert!(!raw.is_empty());
        assert_eq!(
            item_terminal_status(raw.last().unwrap()),
            Some(StreamStatus::Stopped)
        );

        // Final task status mirrors the outcome.
        let task = status::read_task_status(harness.state.coord.as_ref(), run_id)
            .await
            .unwrap();
        assert_eq!(task.status, "stopped");
    }

    #[tokio::test]
    async fn engine_reported_failure_finalizes_as_failed() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness
            .queued_run(testing::failing_items("engine exploded"))
            .await;

        execute_run(harness.state.clone(), job).await;

        let run = harness.state.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("engine exploded"));
        let raw = harness.responses(run_id).await;
        assert_eq!(
            item_terminal_status(raw.last().unwrap()),
            Some(StreamStatus::Failed)
        );
    }

    #[tokio::test]
    async fn targeted_control_channel_also_stops() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness.queued_run(testing::endless_items()).await;
        let instance = harness.state.instance_id.clone();

        let exec = tokio::spawn(execute_run(harness.state.clone(), job));
        tokio::time::sleep(Duration::from_millis(60)).await;
        harness
            .state
            .coord
            .publish(&keys::run_control_for_instance(run_id, &instance), "STOP")
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), exec)
            .await
            .expect("executor honors targeted stop")
            .unwrap();
        let run = harness.state.db.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Stopped);
    }
}
