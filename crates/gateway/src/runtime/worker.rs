//! Executor workers: long-lived tasks that drain the run-job queue.

use kiln_coordination::JobQueue;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::runtime::executor;
use crate::state::AppState;

/// Spawn `count` worker tasks. Each exits once the queue is closed and
/// drained.
pub fn spawn_workers(state: AppState, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let state = state.clone();
            tokio::spawn(async move {
                tracing::info!(worker, "executor worker started");
                while let Some(job) = state.queue.dequeue().await {
                    let span = tracing::info_span!(
                        "agent_run",
                        run_id = %job.run_id,
                        thread_id = %job.thread_id,
                        request_id = %job.request_id,
                    );
                    executor::execute_run(state.clone(), job).instrument(span).await;
                }
                tracing::info!(worker, "executor worker stopped");
            })
        })
        .collect()
}
