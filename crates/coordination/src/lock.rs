//! Distributed locks with ownership-verified release and monitoring.
//!
//! Lock values encode `{owner}:{unix_seconds_acquired}`. Release is a
//! conditional delete on the owner prefix; reclaim of a stale lock is a
//! compare-and-set on the exact current value, so two reclaimers can
//! never both win.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_domain::Result;
use parking_lot::Mutex;
use serde::Serialize;

use crate::store::{CoordStore, SetMode};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lock values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn lock_value(owner: &str, acquired_at_unix: i64) -> String {
    format!("{owner}:{acquired_at_unix}")
}

/// Parse `{owner}:{unix_seconds}`. Returns `None` for malformed values.
pub fn parse_lock_value(value: &str) -> Option<(&str, i64)> {
    let (owner, ts) = value.split_once(':')?;
    let ts = ts.parse().ok()?;
    Some((owner, ts))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock was free and is now ours.
    Acquired,
    /// A stale lock (older than half its TTL) was taken over.
    Reclaimed,
    /// Someone else holds a live lock; the caller must back off.
    Held,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Monitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const LONG_HELD_WARN: Duration = Duration::from_secs(30);
const DEADLOCK_SUSPECT: Duration = Duration::from_secs(60);

struct HeldLock {
    operation: String,
    since: Instant,
}

#[derive(Default)]
struct MonitorInner {
    held: HashMap<String, HeldLock>,
    acquired_total: u64,
    released_total: u64,
    reclaimed_total: u64,
    failures_total: u64,
}

/// Point-in-time view of lock activity, served by the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct LockMetrics {
    pub currently_held: usize,
    pub acquired_total: u64,
    pub released_total: u64,
    pub reclaimed_total: u64,
    pub failures_total: u64,
    pub long_held: Vec<LongHeldLock>,
    pub potential_deadlocks: Vec<LongHeldLock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LongHeldLock {
    pub key: String,
    pub operation: String,
    pub held_secs: u64,
}

/// Records every acquisition, release, and failure with duration and
/// holder identity. Locks held past 30 s surface as warnings; past 60 s
/// they count as potential deadlocks.
#[derive(Default)]
pub struct LockMonitor {
    inner: Mutex<MonitorInner>,
}

impl LockMonitor {
    pub fn record_acquired(&self, key: &str, operation: &str) {
        let mut inner = self.inner.lock();
        inner.acquired_total += 1;
        inner.held.insert(
            key.to_owned(),
            HeldLock {
                operation: operation.to_owned(),
                since: Instant::now(),
            },
        );
    }

    pub fn record_reclaimed(&self, key: &str, operation: &str) {
        {
            let mut inner = self.inner.lock();
            inner.reclaimed_total += 1;
        }
        self.record_acquired(key, operation);
    }

    pub fn record_released(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.released_total += 1;
        if let Some(held) = inner.held.remove(key) {
            let duration = held.since.elapsed();
            if duration > LONG_HELD_WARN {
                tracing::warn!(
                    key,
                    operation = %held.operation,
                    held_secs = duration.as_secs(),
                    "lock was held for a long time"
                );
            }
        }
    }

    pub fn record_failure(&self, key: &str, operation: &str, reason: &str) {
        let mut inner = self.inner.lock();
        inner.failures_total += 1;
        tracing::debug!(key, operation, reason, "lock acquisition failed");
    }

    pub fn metrics(&self) -> LockMetrics {
        let inner = self.inner.lock();
        let collect = |threshold: Duration| -> Vec<LongHeldLock> {
            inner
                .held
                .iter()
                .filter(|(_, h)| h.since.elapsed() > threshold)
                .map(|(k, h)| LongHeldLock {
                    key: k.clone(),
                    operation: h.operation.clone(),
                    held_secs: h.since.elapsed().as_secs(),
                })
                .collect()
        };
        LockMetrics {
            currently_held: inner.held.len(),
            acquired_total: inner.acquired_total,
            released_total: inner.released_total,
            reclaimed_total: inner.reclaimed_total,
            failures_total: inner.failures_total,
            long_held: collect(LONG_HELD_WARN),
            potential_deadlocks: collect(DEADLOCK_SUSPECT),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct LockManager {
    store: Arc<dyn CoordStore>,
    monitor: Arc<LockMonitor>,
}

impl LockManager {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self {
            store,
            monitor: Arc::new(LockMonitor::default()),
        }
    }

    pub fn monitor(&self) -> Arc<LockMonitor> {
        self.monitor.clone()
    }

    /// Plain SET-NX acquisition.
    pub async fn acquire(
        &self,
        key: &str,
        owner: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let value = lock_value(owner, chrono::Utc::now().timestamp());
        let acquired = self.store.set(key, &value, ttl, SetMode::IfAbsent).await?;
        if acquired {
            self.monitor.record_acquired(key, operation);
        } else {
            self.monitor.record_failure(key, operation, "already_locked");
        }
        Ok(acquired)
    }

    /// Acquisition with stale-lock takeover: a lock whose recorded
    /// timestamp is older than `ttl/2` may be reclaimed via
    /// compare-and-set on the exact observed value. Losing the CAS means
    /// another instance updated the lock first.
    pub async fn acquire_or_reclaim(
        &self,
        key: &str,
        owner: &str,
        operation: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        if self.acquire(key, owner, operation, ttl).await? {
            return Ok(LockAttempt::Acquired);
        }

        let Some(existing) = self.store.get(key).await? else {
            // Lost a race with a release; treat as held and let the
            // caller's dedup semantics decide.
            return Ok(LockAttempt::Held);
        };

        let Some((held_by, acquired_ts)) = parse_lock_value(&existing) else {
            tracing::warn!(key, value = %existing, "malformed lock value");
            return Ok(LockAttempt::Held);
        };

        let age = chrono::Utc::now().timestamp() - acquired_ts;
        if age <= (ttl.as_secs() / 2) as i64 {
            tracing::debug!(key, held_by, age, "lock held by live owner");
            return Ok(LockAttempt::Held);
        }

        tracing::warn!(key, held_by, age, "detected potentially stale lock");
        let new_value = lock_value(owner, chrono::Utc::now().timestamp());
        if self
            .store
            .compare_and_set(key, &existing, &new_value, ttl)
            .await?
        {
            tracing::info!(key, previous_owner = held_by, "reclaimed stale lock");
            self.monitor.record_reclaimed(key, operation);
            Ok(LockAttempt::Reclaimed)
        } else {
            self.monitor
                .record_failure(key, operation, "reclaim_lost_race");
            Ok(LockAttempt::Held)
        }
    }

    /// Ownership-verified release: deletes only when the stored value
    /// still begins with `{owner}:`.
    pub async fn release(&self, key: &str, owner: &str) -> Result<bool> {
        let released = self
            .store
            .delete_if_prefix(key, &format!("{owner}:"))
            .await?;
        if released {
            self.monitor.record_released(key);
        } else {
            tracing::debug!(key, owner, "lock not owned by this instance, skipping release");
        }
        Ok(released)
    }
}
