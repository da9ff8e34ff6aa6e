//! The run-job queue feeding executor workers.
//!
//! Delivery is at-least-once: the executor's per-run lock deduplicates,
//! so a job may be delivered to several workers without harm.

use async_trait::async_trait;
use kiln_domain::entities::AppType;
use kiln_domain::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Wire contract for one queued run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJob {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub instance_id: String,
    pub project_id: Uuid,
    pub model: String,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub enable_context_manager: bool,
    #[serde(default)]
    pub is_agent_builder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
    pub request_id: String,
    pub app_type: AppType,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: RunJob) -> Result<()>;

    /// Next job, or `None` once the queue has been closed and drained.
    async fn dequeue(&self) -> Option<RunJob>;

    /// Stop accepting new jobs; workers exit after draining.
    fn close(&self);
}

/// In-process queue on an unbounded channel. Workers share the receiver
/// behind an async mutex so each job goes to exactly one worker per
/// delivery.
pub struct MemoryJobQueue {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<RunJob>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RunJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: RunJob) -> Result<()> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx
                .send(job)
                .map_err(|_| Error::Internal("job queue receiver dropped".into())),
            None => Err(Error::Internal("job queue is closed".into())),
        }
    }

    async fn dequeue(&self) -> Option<RunJob> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn close(&self) {
        self.tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(run_id: Uuid) -> RunJob {
        RunJob {
            run_id,
            thread_id: Uuid::new_v4(),
            instance_id: "test".into(),
            project_id: Uuid::new_v4(),
            model: "openrouter/openai/gpt-4o".into(),
            enable_thinking: false,
            reasoning_effort: None,
            stream: true,
            enable_context_manager: false,
            is_agent_builder: false,
            target_agent_id: None,
            request_id: Uuid::new_v4().to_string(),
            app_type: AppType::Web,
        }
    }

    #[tokio::test]
    async fn fifo_delivery() {
        let q = MemoryJobQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(job(a)).await.unwrap();
        q.enqueue(job(b)).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().run_id, a);
        assert_eq!(q.dequeue().await.unwrap().run_id, b);
    }

    #[tokio::test]
    async fn duplicate_enqueue_delivers_twice() {
        // At-least-once: redelivery of the same run_id is legal and the
        // executor's lock is what deduplicates.
        let q = MemoryJobQueue::new();
        let id = Uuid::new_v4();
        q.enqueue(job(id)).await.unwrap();
        q.enqueue(job(id)).await.unwrap();
        assert_eq!(q.dequeue().await.unwrap().run_id, id);
        assert_eq!(q.dequeue().await.unwrap().run_id, id);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = MemoryJobQueue::new();
        q.enqueue(job(Uuid::new_v4())).await.unwrap();
        q.close();
        assert!(q.enqueue(job(Uuid::new_v4())).await.is_err());
        assert!(q.dequeue().await.is_some());
        assert!(q.dequeue().await.is_none());
    }

    #[test]
    fn job_wire_format() {
        let j = job(Uuid::nil());
        let json = serde_json::to_value(&j).unwrap();
        assert_eq!(json["run_id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["app_type"], "web");
        assert!(json.get("reasoning_effort").is_none());
    }
}
