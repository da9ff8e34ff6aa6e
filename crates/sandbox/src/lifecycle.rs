//! Idempotent sandbox startup.
//!
//! `ensure_running` serializes concurrent callers on the same sandbox
//! through `sandbox_state_lock:{id}` and polls readiness with a
//! progressive backoff. When the provider reports a memory-quota error,
//! capacity is reclaimed by stopping the oldest running sandbox (under
//! its own state lock) and the start is retried once.
//!
//! Lock hierarchy: `sandbox_allocation_lock` may be held while taking a
//! `sandbox_state_lock`, never the other way around.

use std::time::Duration;

use kiln_coordination::{keys, LockManager};
use kiln_domain::{Error, Result};

use crate::provider::{is_memory_quota_error, SandboxInfo, SandboxProvider, SandboxState};

#[derive(Debug, Clone)]
pub struct ReadinessPolicy {
    pub initial_interval: Duration,
    pub slow_interval: Duration,
    /// Switch to the slow interval after this many polls.
    pub slow_after_polls: u32,
    pub max_wait: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            slow_interval: Duration::from_secs(1),
            slow_after_polls: 10,
            max_wait: Duration::from_secs(30),
        }
    }
}

const STATE_LOCK_TTL: Duration = Duration::from_secs(60);

/// Get the sandbox into the Running state, starting it if necessary.
pub async fn ensure_running(
    provider: &dyn SandboxProvider,
    locks: &LockManager,
    owner: &str,
    sandbox_id: &str,
    policy: &ReadinessPolicy,
) -> Result<SandboxInfo> {
    let lock_key = keys::sandbox_state_lock(sandbox_id);

    let mut acquired = locks
        .acquire(&lock_key, owner, "sandbox_state", STATE_LOCK_TTL)
        .await?;
    if !acquired {
        // Another operation is mid-transition; give it a moment.
        tokio::time::sleep(Duration::from_secs(2)).await;
        acquired = locks
            .acquire(&lock_key, owner, "sandbox_state_retry", STATE_LOCK_TTL)
            .await?;
    }
    if !acquired {
        return Err(Error::Conflict(format!(
            "sandbox {sandbox_id} is busy with another state operation"
        )));
    }

    let result = start_locked(provider, locks, owner, sandbox_id, policy).await;

    if let Err(e) = locks.release(&lock_key, owner).await {
        tracing::warn!(sandbox_id, error = %e, "failed to release sandbox state lock");
    }
    result
}

async fn start_locked(
    provider: &dyn SandboxProvider,
    locks: &LockManager,
    owner: &str,
    sandbox_id: &str,
    policy: &ReadinessPolicy,
) -> Result<SandboxInfo> {
    let info = provider.get(sandbox_id).await?;
    match info.state {
        SandboxState::Running => return Ok(info),
        SandboxState::Deleted => {
            return Err(Error::NotFound(format!("sandbox {sandbox_id} was deleted")))
        }
        SandboxState::Stopped | SandboxState::Archived | SandboxState::Creating => {}
    }

    if info.state != SandboxState::Creating {
        tracing::info!(sandbox_id, state = ?info.state, "starting sandbox");
        if let Err(e) = provider.start(sandbox_id).await {
            if is_memory_quota_error(&e) {
                tracing::warn!(
                    sandbox_id,
                    "provider memory quota exceeded, stopping oldest running sandbox and retrying"
                );
                reclaim_capacity(provider, locks, owner, sandbox_id).await?;
                provider.start(sandbox_id).await?;
            } else {
                return Err(e);
            }
        }
    }

    wait_until_running(provider, sandbox_id, policy).await
}

/// Stop the oldest running sandbox other than `target`, under its own
/// state lock.
async fn reclaim_capacity(
    provider: &dyn SandboxProvider,
    locks: &LockManager,
    owner: &str,
    target: &str,
) -> Result<()> {
    let victim = provider
        .list()
        .await?
        .into_iter()
        .filter(|s| s.state == SandboxState::Running && s.id != target)
        .min_by_key(|s| s.created_at);

    let Some(victim) = victim else {
        return Err(Error::ResourceExhausted(
            "memory quota exceeded and no running sandbox is reclaimable".into(),
        ));
    };

    let victim_lock = keys::sandbox_state_lock(&victim.id);
    if !locks
        .acquire(&victim_lock, owner, "sandbox_reclaim", STATE_LOCK_TTL)
        .await?
    {
        return Err(Error::ResourceExhausted(format!(
            "memory quota exceeded; oldest sandbox {} is locked",
            victim.id
        )));
    }

    let stopped = provider.stop(&victim.id).await;
    if let Err(e) = locks.release(&victim_lock, owner).await {
        tracing::warn!(sandbox_id = %victim.id, error = %e, "failed to release reclaim lock");
    }
    stopped?;
    tracing::info!(stopped = %victim.id, "reclaimed provider capacity");
    Ok(())
}

/// Poll until the sandbox reports Running: half-second steps, stretched
/// to one second after ten polls, bounded by `max_wait`.
pub async fn wait_until_running(
    provider: &dyn SandboxProvider,
    sandbox_id: &str,
    policy: &ReadinessPolicy,
) -> Result<SandboxInfo> {
    let started = tokio::time::Instant::now();
    let mut polls = 0u32;
    loop {
        let info = provider.get(sandbox_id).await?;
        if info.state == SandboxState::Running {
            return Ok(info);
        }
        if started.elapsed() >= policy.max_wait {
            return Err(Error::UpstreamTransient(format!(
                "sandbox {sandbox_id} not running after {:?} (state: {:?})",
                policy.max_wait, info.state
            )));
        }
        let interval = if polls > policy.slow_after_polls {
            policy.slow_interval
        } else {
            policy.initial_interval
        };
        polls += 1;
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubProvider;
    use kiln_coordination::MemoryStore;
    use std::sync::Arc;

    fn fast_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            initial_interval: Duration::from_millis(5),
            slow_interval: Duration::from_millis(10),
            slow_after_polls: 3,
            max_wait: Duration::from_millis(500),
        }
    }

    fn locks() -> LockManager {
        LockManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn running_sandbox_is_a_noop() {
        let provider = StubProvider::new();
        let info = provider.create("snap").await.unwrap();
        let locks = locks();

        let out = ensure_running(&provider, &locks, "i1", &info.id, &fast_policy())
            .await
            .unwrap();
        assert_eq!(out.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn stopped_sandbox_is_started_and_polled() {
        let provider = StubProvider::with_start_delay(Duration::from_millis(30));
        let info = provider.create("snap").await.unwrap();
        provider.stop(&info.id).await.unwrap();
        let locks = locks();

        let out = ensure_running(&provider, &locks, "i1", &info.id, &fast_policy())
            .await
            .unwrap();
        assert_eq!(out.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn readiness_timeout_is_an_error() {
        let provider = StubProvider::with_start_delay(Duration::from_secs(60));
        let info = provider.create("snap").await.unwrap();
        provider.stop(&info.id).await.unwrap();
        let locks = locks();

        let policy = ReadinessPolicy {
            max_wait: Duration::from_millis(40),
            ..fast_policy()
        };
        let err = ensure_running(&provider, &locks, "i1", &info.id, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamTransient(_)));
    }

    #[tokio::test]
    async fn memory_quota_stops_oldest_and_retries() {
        let provider = StubProvider::new();
        let oldest = provider.create("snap").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = provider.create("snap").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let target = provider.create("snap").await.unwrap();
        provider.stop(&target.id).await.unwrap();
        let locks = locks();

        provider.fail_next_with_memory_quota(1);
        let out = ensure_running(&provider, &locks, "i1", &target.id, &fast_policy())
            .await
            .unwrap();
        assert_eq!(out.state, SandboxState::Running);

        // The oldest non-target sandbox was stopped to free capacity.
        assert_eq!(
            provider.get(&oldest.id).await.unwrap().state,
            SandboxState::Stopped
        );
        assert_eq!(
            provider.get(&newer.id).await.unwrap().state,
            SandboxState::Running
        );
    }

    #[tokio::test]
    async fn state_lock_serializes_concurrent_callers() {
        let provider = StubProvider::new();
        let info = provider.create("snap").await.unwrap();
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone());

        // Hold the state lock from elsewhere; the call waits 2 s, retries
        // once, then gives up with Conflict.
        locks
            .acquire(
                &keys::sandbox_state_lock(&info.id),
                "other",
                "test",
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = ensure_running(&provider, &locks, "i1", &info.id, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
