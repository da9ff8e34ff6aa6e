//! The sandbox-provider seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiln_domain::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::capability::{FilesystemOps, ProcessOps};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Creating,
    Running,
    Stopped,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
}

/// Hosting-API operations for sandbox lifecycle. `start`/`stop` are
/// asynchronous on the provider side — callers poll `get` for the state
/// transition (see [`crate::lifecycle`]).
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, snapshot: &str) -> Result<SandboxInfo>;
    async fn get(&self, sandbox_id: &str) -> Result<SandboxInfo>;
    async fn start(&self, sandbox_id: &str) -> Result<()>;
    async fn stop(&self, sandbox_id: &str) -> Result<()>;
    async fn delete(&self, sandbox_id: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<SandboxInfo>>;

    fn filesystem(&self, sandbox_id: &str) -> Arc<dyn FilesystemOps>;
    fn processes(&self, sandbox_id: &str) -> Arc<dyn ProcessOps>;
}

/// Providers report capacity exhaustion as a memory-quota error; the
/// lifecycle layer reacts by stopping the oldest running sandbox.
pub fn is_memory_quota_error(error: &Error) -> bool {
    matches!(error, Error::ResourceExhausted(msg) if msg.to_lowercase().contains("memory quota"))
}

/// Creation retry schedule: long attempts, two retries with widening
/// backoff.
#[derive(Debug, Clone)]
pub struct CreateRetryPolicy {
    pub attempt_timeout: Duration,
    pub backoffs: Vec<Duration>,
}

impl Default for CreateRetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(300),
            backoffs: vec![Duration::from_secs(10), Duration::from_secs(20)],
        }
    }
}

/// Create a sandbox with timeout and retry. Memory-quota errors are not
/// retried here — the caller owns the reclaim decision.
pub async fn create_with_retry(
    provider: &dyn SandboxProvider,
    snapshot: &str,
    policy: &CreateRetryPolicy,
) -> Result<SandboxInfo> {
    let mut last_error = None;
    for attempt in 0..=policy.backoffs.len() {
        if attempt > 0 {
            tokio::time::sleep(policy.backoffs[attempt - 1]).await;
        }
        match tokio::time::timeout(policy.attempt_timeout, provider.create(snapshot)).await {
            Ok(Ok(info)) => return Ok(info),
            Ok(Err(e)) if is_memory_quota_error(&e) => return Err(e),
            Ok(Err(e)) => {
                tracing::warn!(snapshot, attempt, error = %e, "sandbox creation failed");
                last_error = Some(e);
            }
            Err(_) => {
                tracing::warn!(snapshot, attempt, "sandbox creation timed out");
                last_error = Some(Error::UpstreamTransient(format!(
                    "sandbox creation timed out after {:?}",
                    policy.attempt_timeout
                )));
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::Internal("sandbox creation failed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_quota_detection() {
        assert!(is_memory_quota_error(&Error::ResourceExhausted(
            "Total memory quota exceeded".into()
        )));
        assert!(!is_memory_quota_error(&Error::ResourceExhausted(
            "pool at capacity".into()
        )));
        assert!(!is_memory_quota_error(&Error::Internal(
            "memory quota".into()
        )));
    }

    #[test]
    fn default_retry_policy_values() {
        let policy = CreateRetryPolicy::default();
        assert_eq!(policy.attempt_timeout, Duration::from_secs(300));
        assert_eq!(
            policy.backoffs,
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
    }
}
