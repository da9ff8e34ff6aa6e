//! SSE stream delivery.
//!
//! Each subscriber replays the full response log from index zero, then
//! tails live appends via pub/sub until a terminal status item or
//! control signal arrives. Heartbeats every 30 seconds keep proxies from
//! idle-closing the connection. The emitted sequence is always a
//! prefix-extension of the canonical log — items are never reordered or
//! dropped.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_core::Stream;
use futures_util::StreamExt;
use kiln_coordination::{keys, CoordStore};
use kiln_domain::run::RunStatus;
use kiln_domain::stream::{ControlSignal, StreamItem, StreamStatus};
use kiln_store::Database;
use uuid::Uuid;

use crate::runtime::item_terminal_status;
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MAX_LISTENER_FAILURES: u32 = 3;

fn status_payload(status: StreamStatus, message: Option<String>) -> String {
    serde_json::to_string(&StreamItem::status(status, message))
        .unwrap_or_else(|_| r#"{"type":"status","status":"error"}"#.to_string())
}

fn ping_payload() -> String {
    serde_json::to_string(&StreamItem::Ping).unwrap_or_else(|_| r#"{"type":"ping"}"#.to_string())
}

/// Full SSE response with the proxy-friendly headers the protocol
/// requires.
pub fn sse_response(state: AppState, run_id: Uuid) -> Response {
    let stream = response_payloads(state, run_id)
        .map(|payload| Ok::<_, Infallible>(Event::default().data(payload)));
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        "Cache-Control",
        "no-cache, no-transform".parse().expect("static header value"),
    );
    headers.insert("X-Accel-Buffering", "no".parse().expect("static header value"));
    response
}

/// The per-subscriber payload sequence: history, then live tail, always
/// terminated by a status payload when the run is (or becomes) terminal.
pub fn response_payloads(state: AppState, run_id: Uuid) -> impl Stream<Item = String> {
    async_stream::stream! {
        let responses_key = keys::run_responses(run_id);

        // 1. Replay everything appended so far.
        let mut last_index: i64 = -1;
        match state.coord.list_range(&responses_key, 0, -1).await {
            Ok(items) => {
                last_index = items.len() as i64 - 1;
                for raw in items {
                    yield raw;
                }
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "failed to read response log");
                yield status_payload(
                    StreamStatus::Error,
                    Some("failed to set up response streaming".to_string()),
                );
                return;
            }
        }

        // 2. Durable status after the replay: terminal runs close here.
        let run_status = match state.db.get_run(run_id).await {
            Ok(Some(run)) => run.status,
            Ok(None) => {
                yield status_payload(StreamStatus::Error, Some("run not found".to_string()));
                return;
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "failed to load run row for stream");
                yield status_payload(StreamStatus::Error, Some(e.to_string()));
                return;
            }
        };
        if run_status.is_terminal() {
            let status = match run_status {
                RunStatus::Failed => StreamStatus::Failed,
                RunStatus::Stopped => StreamStatus::Stopped,
                _ => StreamStatus::Completed,
            };
            yield status_payload(status, None);
            return;
        }

        // 3. Fresh pub/sub sessions for this subscriber.
        let mut response_sub = state.coord.subscribe(&keys::run_new_response(run_id));
        let mut control_sub = state.coord.subscribe(&keys::run_control(run_id));

        // Catch up on anything appended between the replay and the
        // subscriptions; the notification for those items predates us.
        match state.coord.list_range(&responses_key, last_index + 1, -1).await {
            Ok(missed) => {
                for raw in missed {
                    last_index += 1;
                    let terminal = item_terminal_status(&raw).is_some();
                    yield raw;
                    if terminal {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%run_id, error = %e, "catch-up read failed");
            }
        }

        // 4. Live tail.
        let mut failures: u32 = 0;
        loop {
            enum Wake {
                NewResponse(Option<String>),
                Control(Option<String>),
                Heartbeat,
            }

            let wake = tokio::select! {
                m = response_sub.recv() => Wake::NewResponse(m),
                m = control_sub.recv() => Wake::Control(m),
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => Wake::Heartbeat,
            };

            match wake {
                Wake::Heartbeat => {
                    yield ping_payload();
                }
                Wake::NewResponse(Some(_)) => {
                    let new_items = match state
                        .coord
                        .list_range(&responses_key, last_index + 1, -1)
                        .await
                    {
                        Ok(items) => items,
                        Err(e) => {
                            tracing::warn!(%run_id, error = %e, "tail read failed");
                            continue;
                        }
                    };
                    let count = new_items.len() as i64;
                    let mut terminated = false;
                    for raw in new_items {
                        let terminal = item_terminal_status(&raw).is_some();
                        yield raw;
                        if terminal {
                            terminated = true;
                            break;
                        }
                    }
                    last_index += count;
                    if terminated {
                        return;
                    }
                }
                Wake::Control(Some(signal)) => {
                    if let Some(signal) = ControlSignal::from_wire(&signal) {
                        tracing::debug!(%run_id, signal = signal.as_wire(), "control signal closes stream");
                        yield status_payload(signal.terminal_stream_status(), None);
                        return;
                    }
                }
                Wake::NewResponse(None) | Wake::Control(None) => {
                    failures += 1;
                    if failures >= MAX_LISTENER_FAILURES {
                        tracing::error!(%run_id, failures, "stream listener failed repeatedly");
                        yield status_payload(
                            StreamStatus::Error,
                            Some("streaming connection lost".to_string()),
                        );
                        return;
                    }
                    tracing::warn!(%run_id, failures, "stream listener lost its channel, resubscribing");
                    yield serde_json::to_string(&StreamItem::Warning {
                        message: format!(
                            "stream connection interrupted (attempt {failures}/{MAX_LISTENER_FAILURES})"
                        ),
                    })
                    .unwrap_or_default();
                    response_sub = state.coord.subscribe(&keys::run_new_response(run_id));
                    control_sub = state.coord.subscribe(&keys::run_control(run_id));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::executor::execute_run;
    use crate::runtime::testing::{self, TestHarness};
    use futures_util::StreamExt;

    fn parsed(payload: &str) -> serde_json::Value {
        serde_json::from_str(payload).expect("stream payloads are JSON")
    }

    #[tokio::test]
    async fn completed_run_replays_history_then_terminal_status() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness.queued_run(testing::scripted_items(3, true)).await;
        execute_run(harness.state.clone(), job).await;

        let payloads: Vec<String> =
            response_payloads(harness.state.clone(), run_id).collect().await;

        // 3 content + terminal item from the log + the post-replay
        // durable-status close.
        assert_eq!(payloads.len(), 5);
        for (i, payload) in payloads.iter().take(3).enumerate() {
            let v = parsed(payload);
            assert_eq!(v["type"], "content");
            assert_eq!(v["content"]["text"], format!("chunk {i}"));
        }
        assert_eq!(parsed(&payloads[3])["status"], "completed");
        assert_eq!(parsed(&payloads[4])["status"], "completed");
    }

    #[tokio::test]
    async fn live_tail_follows_appends_in_order() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness.queued_run(testing::endless_items()).await;

        let exec = tokio::spawn(execute_run(harness.state.clone(), job));
        tokio::time::sleep(Duration::from_millis(40)).await;

        let mut stream = Box::pin(response_payloads(harness.state.clone(), run_id));
        let mut seen = Vec::new();

        // Read a few live items then stop the run; the stream must end
        // with a terminal status.
        loop {
            let payload = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("stream makes progress")
                .expect("stream not ended yet");
            let v = parsed(&payload);
            if v["type"] == "status" {
                assert_eq!(v["status"], "stopped");
                break;
            }
            seen.push(v);
            if seen.len() == 5 {
                harness
                    .state
                    .coord
                    .publish(&kiln_coordination::keys::run_control(run_id), "STOP")
                    .await
                    .unwrap();
            }
        }
        assert!(seen.len() >= 5);

        // Order matches the canonical log prefix (seq strictly
        // increasing from 1).
        for (i, item) in seen.iter().enumerate() {
            if item["type"] == "content" {
                assert_eq!(item["content"]["seq"], (i as u64) + 1);
            }
        }

        tokio::time::timeout(Duration::from_secs(5), exec)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_sees_full_history_from_zero() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness.queued_run(testing::scripted_items(10, true)).await;
        execute_run(harness.state.clone(), job).await;

        // Two subscribers at different times both get the identical
        // prefix from index 0 — there is no offset parameter.
        let first: Vec<String> =
            response_payloads(harness.state.clone(), run_id).collect().await;
        let second: Vec<String> =
            response_payloads(harness.state.clone(), run_id).collect().await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 12); // 10 content + terminal + close status
    }

    #[tokio::test]
    async fn unknown_run_yields_single_error_status() {
        let harness = TestHarness::new().await;
        let payloads: Vec<String> =
            response_payloads(harness.state.clone(), Uuid::new_v4()).collect().await;
        assert_eq!(payloads.len(), 1);
        assert_eq!(parsed(&payloads[0])["status"], "error");
    }

    #[tokio::test]
    async fn stream_is_prefix_extension_of_log() {
        let harness = TestHarness::new().await;
        let (job, run_id) = harness.queued_run(testing::scripted_items(4, true)).await;
        execute_run(harness.state.clone(), job).await;

        let log = harness.responses(run_id).await;
        let payloads: Vec<String> =
            response_payloads(harness.state.clone(), run_id).collect().await;

        // The emitted sequence starts with the canonical log verbatim.
        assert!(payloads.len() >= log.len());
        for (emitted, canonical) in payloads.iter().zip(log.iter()) {
            assert_eq!(emitted, canonical);
        }
    }
}
