//! Transient task-status records.
//!
//! The executor mirrors each run's status into a TTL'd key so polling
//! endpoints can report liveness without touching the durable store.

use chrono::{DateTime, Utc};
use kiln_domain::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys;
use crate::store::{CoordStore, SetMode, DEFAULT_TTL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub async fn write_task_status(
    store: &dyn CoordStore,
    run_id: Uuid,
    status: &str,
    data: Option<serde_json::Value>,
) -> Result<()> {
    let record = TaskStatus {
        status: status.to_owned(),
        timestamp: Utc::now(),
        data,
    };
    store
        .set(
            &keys::task_status(run_id),
            &serde_json::to_string(&record)?,
            DEFAULT_TTL,
            SetMode::Always,
        )
        .await?;
    Ok(())
}

/// Best-effort read; unparseable or missing records read as `None`.
pub async fn read_task_status(store: &dyn CoordStore, run_id: Uuid) -> Option<TaskStatus> {
    let raw = store.get(&keys::task_status(run_id)).await.ok()??;
    match serde_json::from_str(&raw) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(%run_id, error = %e, "unparseable task status record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[tokio::test]
    async fn write_then_read() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        write_task_status(&store, run_id, "running", None).await.unwrap();

        let status = read_task_status(&store, run_id).await.unwrap();
        assert_eq!(status.status, "running");
        assert!(status.data.is_none());
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let store = MemoryStore::new();
        assert!(read_task_status(&store, Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn data_payload_roundtrips() {
        let store = MemoryStore::new();
        let run_id = Uuid::new_v4();
        write_task_status(
            &store,
            run_id,
            "failed",
            Some(serde_json::json!({"error": "boom"})),
        )
        .await
        .unwrap();

        let status = read_task_status(&store, run_id).await.unwrap();
        assert_eq!(status.status, "failed");
        assert_eq!(status.data.unwrap()["error"], "boom");
    }
}
