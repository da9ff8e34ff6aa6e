//! Orchestration core: dispatcher, executor, stream delivery, workers,
//! and the agent-engine seam.

pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod keys;
pub mod stream;
pub mod worker;

use kiln_domain::stream::StreamStatus;

/// Terminal status carried by a serialized stream item, if any. Works on
/// raw log entries without assuming they parse as our own item enum.
pub(crate) fn item_terminal_status(raw: &str) -> Option<StreamStatus> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    if value.get("type")?.as_str()? != "status" {
        return None;
    }
    match value.get("status")?.as_str()? {
        "completed" => Some(StreamStatus::Completed),
        "failed" => Some(StreamStatus::Failed),
        "stopped" => Some(StreamStatus::Stopped),
        _ => None,
    }
}
