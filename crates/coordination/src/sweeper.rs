//! Stale-lock janitor.
//!
//! A worker that crashes between acquiring its run lock and cleanup
//! leaves the lock behind until its TTL expires. The sweeper shortens
//! that window: every minute it scans the lock namespace and deletes
//! entries whose embedded timestamp is older than the age threshold.
//! Malformed values count as stale.

use std::sync::Arc;
use std::time::Duration;

use kiln_domain::Result;
use tokio::task::JoinHandle;

use crate::keys;
use crate::lock::parse_lock_value;
use crate::store::CoordStore;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub max_lock_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_lock_age: Duration::from_secs(300),
        }
    }
}

/// One sweep pass. Returns the number of locks removed.
pub async fn sweep_stale_locks(store: &dyn CoordStore, max_lock_age: Duration) -> Result<usize> {
    let now = chrono::Utc::now().timestamp();
    let mut cleaned = 0;

    for key in store.scan(keys::RUN_LOCK_PATTERN).await? {
        let Some(value) = store.get(&key).await? else {
            continue;
        };
        let age = match parse_lock_value(&value) {
            Some((_, ts)) => now - ts,
            // Unparseable lock values cannot be attributed to a live
            // owner; treat them as stale.
            None => max_lock_age.as_secs() as i64 + 1,
        };
        if age > max_lock_age.as_secs() as i64 {
            tracing::warn!(key, age, "cleaning up stale lock");
            if store.delete(&key).await? {
                cleaned += 1;
            }
        }
    }

    if cleaned > 0 {
        tracing::info!(cleaned, "stale lock sweep removed locks");
    }
    Ok(cleaned)
}

/// Spawn the periodic sweeper. Runs one pass immediately so locks left
/// by a previous incarnation are cleared at startup.
pub fn spawn(store: Arc<dyn CoordStore>, config: SweeperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = config.interval.as_secs(),
            max_age_secs = config.max_lock_age.as_secs(),
            "stale lock sweeper started"
        );
        if let Err(e) = sweep_stale_locks(store.as_ref(), config.max_lock_age).await {
            tracing::error!(error = %e, "startup stale lock sweep failed");
        }

        let mut ticker = tokio::time::interval(config.interval);
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_stale_locks(store.as_ref(), config.max_lock_age).await {
                tracing::error!(error = %e, "stale lock sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_value;
    use crate::memory::MemoryStore;
    use crate::store::{SetMode, DEFAULT_TTL};
    use uuid::Uuid;

    #[tokio::test]
    async fn removes_only_stale_locks() {
        let store = MemoryStore::new();
        let fresh_key = keys::run_lock(Uuid::new_v4());
        let stale_key = keys::run_lock(Uuid::new_v4());
        let now = chrono::Utc::now().timestamp();

        store
            .set(&fresh_key, &lock_value("a", now), DEFAULT_TTL, SetMode::Always)
            .await
            .unwrap();
        store
            .set(
                &stale_key,
                &lock_value("b", now - 400),
                DEFAULT_TTL,
                SetMode::Always,
            )
            .await
            .unwrap();

        let cleaned = sweep_stale_locks(&store, Duration::from_secs(300)).await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(store.get(&fresh_key).await.unwrap().is_some());
        assert!(store.get(&stale_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_lock_counts_as_stale() {
        let store = MemoryStore::new();
        let key = keys::run_lock(Uuid::new_v4());
        store
            .set(&key, "not-a-lock-value", DEFAULT_TTL, SetMode::Always)
            .await
            .unwrap();

        let cleaned = sweep_stale_locks(&store, Duration::from_secs(300)).await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ignores_other_namespaces() {
        let store = MemoryStore::new();
        store
            .set("task_status:x", "whatever", DEFAULT_TTL, SetMode::Always)
            .await
            .unwrap();
        let cleaned = sweep_stale_locks(&store, Duration::from_secs(0)).await.unwrap();
        assert_eq!(cleaned, 0);
        assert!(store.get("task_status:x").await.unwrap().is_some());
    }
}
