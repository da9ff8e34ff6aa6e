//! The sandbox pool.
//!
//! Hands each user exactly one sandbox, reusing an existing assignment,
//! then a pre-warmed instance, then a fresh creation. Warm pools are
//! partitioned by app type and replenished in the background; idle
//! sandboxes are released on a maintenance cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use kiln_coordination::{keys, LockManager};
use kiln_domain::config::PoolSettings;
use kiln_domain::entities::AppType;
use kiln_domain::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::capability::ProcessOps;
use crate::lifecycle::{wait_until_running, ReadinessPolicy};
use crate::provider::{create_with_retry, CreateRetryPolicy, SandboxInfo, SandboxProvider};

const ALLOCATION_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SnapshotNames {
    pub web: String,
    pub mobile: String,
}

impl SnapshotNames {
    fn for_app(&self, app_type: AppType) -> &str {
        match app_type {
            AppType::Web => &self.web,
            AppType::Mobile => &self.mobile,
        }
    }
}

struct SandboxMetrics {
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    total_requests: u64,
}

#[derive(Default)]
struct PoolInner {
    active: HashMap<String, SandboxInfo>,
    warm: HashMap<AppType, Vec<SandboxInfo>>,
    /// user_id -> sandbox_id and its inverse. Both maps are only ever
    /// mutated together, inside one critical section.
    user_sandboxes: HashMap<String, String>,
    sandbox_users: HashMap<String, String>,
    /// Immutable app type per sandbox.
    app_types: HashMap<String, AppType>,
    metrics: HashMap<String, SandboxMetrics>,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.active.len() + self.warm.values().map(Vec::len).sum::<usize>()
    }

    fn warm_count(&self, app_type: AppType) -> usize {
        self.warm.get(&app_type).map(Vec::len).unwrap_or(0)
    }

    fn touch(&mut self, sandbox_id: &str) {
        let entry = self
            .metrics
            .entry(sandbox_id.to_owned())
            .or_insert_with(|| SandboxMetrics {
                created_at: Utc::now(),
                last_used: Utc::now(),
                total_requests: 0,
            });
        entry.last_used = Utc::now();
        entry.total_requests += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub active_sandboxes: usize,
    pub warm_sandboxes: usize,
    pub warm_web_sandboxes: usize,
    pub warm_mobile_sandboxes: usize,
    pub total_sandboxes: usize,
    pub max_sandboxes: usize,
    pub utilization: f64,
    pub avg_requests_per_sandbox: f64,
}

pub struct SandboxPool {
    provider: Arc<dyn SandboxProvider>,
    locks: Arc<LockManager>,
    config: PoolSettings,
    snapshots: SnapshotNames,
    instance_id: String,
    create_policy: CreateRetryPolicy,
    readiness: ReadinessPolicy,
    inner: Mutex<PoolInner>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxPool {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        locks: Arc<LockManager>,
        config: PoolSettings,
        snapshots: SnapshotNames,
        instance_id: String,
    ) -> Self {
        Self {
            provider,
            locks,
            config,
            snapshots,
            instance_id,
            create_policy: CreateRetryPolicy::default(),
            readiness: ReadinessPolicy::default(),
            inner: Mutex::new(PoolInner::default()),
            maintenance: Mutex::new(None),
        }
    }

    /// Shorten the create/readiness schedules (tests).
    pub fn with_timing(mut self, create: CreateRetryPolicy, readiness: ReadinessPolicy) -> Self {
        self.create_policy = create;
        self.readiness = readiness;
        self
    }

    pub fn provider(&self) -> Arc<dyn SandboxProvider> {
        self.provider.clone()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Allocation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Get or create the sandbox for a user. At most one sandbox per
    /// user; under concurrent requests the same instance is returned,
    /// guaranteed by the per-user allocation lock plus a double-check
    /// after acquiring it.
    pub async fn get_sandbox_for_user(
        self: &Arc<Self>,
        user_id: &str,
        project_id: &str,
        app_type: AppType,
    ) -> Result<SandboxInfo> {
        let lock_key = keys::sandbox_allocation_lock(user_id);
        let mut acquired = self
            .locks
            .acquire(&lock_key, &self.instance_id, "sandbox_allocation", ALLOCATION_LOCK_TTL)
            .await?;
        if !acquired {
            tokio::time::sleep(Duration::from_millis(100)).await;
            acquired = self
                .locks
                .acquire(
                    &lock_key,
                    &self.instance_id,
                    "sandbox_allocation_retry",
                    ALLOCATION_LOCK_TTL,
                )
                .await?;
        }
        if !acquired {
            return Err(Error::Conflict(format!(
                "failed to acquire sandbox allocation lock for user {user_id}"
            )));
        }

        let result = self.allocate_locked(user_id, project_id, app_type).await;

        if let Err(e) = self.locks.release(&lock_key, &self.instance_id).await {
            tracing::warn!(user_id, error = %e, "failed to release allocation lock");
        }
        result
    }

    async fn allocate_locked(
        self: &Arc<Self>,
        user_id: &str,
        project_id: &str,
        app_type: AppType,
    ) -> Result<SandboxInfo> {
        // Double-check after taking the lock: an earlier request may have
        // assigned a sandbox already.
        {
            let mut inner = self.inner.lock();
            if let Some(sandbox_id) = inner.user_sandboxes.get(user_id).cloned() {
                if let Some(info) = inner.active.get(&sandbox_id).cloned() {
                    inner.touch(&sandbox_id);
                    return Ok(info);
                }
                // Stale mapping; drop both sides before reallocating.
                inner.user_sandboxes.remove(user_id);
                inner.sandbox_users.remove(&sandbox_id);
            }
        }

        // Warm pop first.
        let warm_hit = {
            let mut inner = self.inner.lock();
            inner.warm.entry(app_type).or_default().pop()
        };

        let info = match warm_hit {
            Some(info) => {
                tracing::info!(
                    sandbox_id = %info.id,
                    user_id,
                    app_type = app_type.as_str(),
                    "allocated warm sandbox"
                );
                info
            }
            None => {
                self.check_capacity().await?;
                let snapshot = self.snapshots.for_app(app_type);
                tracing::info!(user_id, project_id, snapshot, "creating sandbox");
                let created =
                    create_with_retry(self.provider.as_ref(), snapshot, &self.create_policy)
                        .await?;
                wait_until_running(self.provider.as_ref(), &created.id, &self.readiness).await?
            }
        };

        // Both direction maps mutate in the same critical section.
        {
            let mut inner = self.inner.lock();
            inner.active.insert(info.id.clone(), info.clone());
            inner.user_sandboxes.insert(user_id.to_owned(), info.id.clone());
            inner.sandbox_users.insert(info.id.clone(), user_id.to_owned());
            inner.app_types.insert(info.id.clone(), app_type);
            inner.touch(&info.id);
        }

        self.maybe_scale_up();
        Ok(info)
    }

    /// Enforce `max_total_sandboxes`, reclaiming idle instances once
    /// before giving up.
    async fn check_capacity(self: &Arc<Self>) -> Result<()> {
        if self.inner.lock().total() < self.config.max_total_sandboxes {
            return Ok(());
        }
        tracing::warn!("sandbox pool at capacity, attempting idle reclaim");
        self.cleanup_idle_sandboxes().await;
        if self.inner.lock().total() < self.config.max_total_sandboxes {
            return Ok(());
        }
        Err(Error::ResourceExhausted(format!(
            "sandbox pool at capacity ({} instances)",
            self.config.max_total_sandboxes
        )))
    }

    fn maybe_scale_up(self: &Arc<Self>) {
        let utilization = {
            let inner = self.inner.lock();
            inner.active.len() as f64 / self.config.max_total_sandboxes as f64
        };
        if utilization > self.config.scale_threshold {
            let pool = self.clone();
            tokio::spawn(async move {
                pool.ensure_warm().await;
            });
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Release
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Decouple a user from their sandbox. The instance goes back to the
    /// warm pool (after a reset) when the per-app-type warm count is
    /// below the minimum, and is terminated otherwise.
    pub async fn release_sandbox(self: &Arc<Self>, user_id: &str, keep_warm: bool) -> Result<()> {
        let (info, app_type, rewarm) = {
            let mut inner = self.inner.lock();
            let Some(sandbox_id) = inner.user_sandboxes.remove(user_id) else {
                return Ok(());
            };
            inner.sandbox_users.remove(&sandbox_id);
            let info = inner.active.remove(&sandbox_id);
            let app_type = inner
                .app_types
                .get(&sandbox_id)
                .copied()
                .unwrap_or(AppType::Web);
            let rewarm = keep_warm && inner.warm_count(app_type) < self.config.min_warm_sandboxes;
            (info, app_type, rewarm)
        };

        let Some(info) = info else {
            return Ok(());
        };

        if rewarm {
            self.reset_sandbox(&info.id).await;
            let mut inner = self.inner.lock();
            inner.warm.entry(app_type).or_default().push(info.clone());
            tracing::info!(
                sandbox_id = %info.id,
                app_type = app_type.as_str(),
                "sandbox returned to warm pool"
            );
        } else {
            if let Err(e) = self.provider.delete(&info.id).await {
                tracing::error!(sandbox_id = %info.id, error = %e, "failed to terminate sandbox");
            }
            let mut inner = self.inner.lock();
            inner.app_types.remove(&info.id);
            inner.metrics.remove(&info.id);
            tracing::info!(
                sandbox_id = %info.id,
                app_type = app_type.as_str(),
                "sandbox terminated"
            );
        }
        Ok(())
    }

    /// A warm-pool sandbox must be clean: local changes discarded and
    /// dev-server processes terminated.
    async fn reset_sandbox(&self, sandbox_id: &str) {
        let processes = self.provider.processes(sandbox_id);
        for command in [
            "git checkout . || true",
            "git clean -fd || true",
            "pkill -f 'npm' || true",
            "pkill -f 'node' || true",
        ] {
            if let Err(e) = processes.exec(command).await {
                tracing::error!(sandbox_id, command, error = %e, "sandbox reset command failed");
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Warm pool & maintenance
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Top every app type's warm pool up to the configured minimum.
    pub async fn ensure_warm(self: &Arc<Self>) {
        for app_type in [AppType::Web, AppType::Mobile] {
            let needed = {
                let inner = self.inner.lock();
                self.config
                    .min_warm_sandboxes
                    .saturating_sub(inner.warm_count(app_type))
            };
            if needed == 0 {
                continue;
            }
            tracing::info!(
                app_type = app_type.as_str(),
                needed,
                "warming up sandboxes"
            );

            let creations = (0..needed).map(|_| {
                let pool = self.clone();
                async move {
                    let snapshot = pool.snapshots.for_app(app_type).to_owned();
                    let created =
                        create_with_retry(pool.provider.as_ref(), &snapshot, &pool.create_policy)
                            .await?;
                    wait_until_running(pool.provider.as_ref(), &created.id, &pool.readiness).await
                }
            });

            for result in join_all(creations).await {
                match result {
                    Ok(info) => {
                        let mut inner = self.inner.lock();
                        inner.app_types.insert(info.id.clone(), app_type);
                        inner.warm.entry(app_type).or_default().push(info);
                    }
                    Err(e) => {
                        tracing::error!(
                            app_type = app_type.as_str(),
                            error = %e,
                            "failed to warm sandbox"
                        );
                    }
                }
            }
        }
    }

    /// Release sandboxes whose `last_used` is beyond `max_idle_time`.
    pub async fn cleanup_idle_sandboxes(self: &Arc<Self>) {
        let idle_cutoff =
            Utc::now() - chrono::Duration::from_std(self.config.max_idle_time).unwrap_or_default();
        let idle_users: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .metrics
                .iter()
                .filter(|(_, m)| m.last_used < idle_cutoff)
                .filter_map(|(id, _)| inner.sandbox_users.get(id).cloned())
                .collect()
        };
        for user_id in idle_users {
            tracing::info!(user_id, "releasing idle sandbox");
            if let Err(e) = self.release_sandbox(&user_id, false).await {
                tracing::error!(user_id, error = %e, "idle sandbox release failed");
            }
        }
    }

    /// Pre-warm and start the maintenance task.
    pub async fn start(self: &Arc<Self>) {
        tracing::info!("starting sandbox pool");
        self.ensure_warm().await;
        {
            let total_warm: usize = {
                let inner = self.inner.lock();
                inner.warm.values().map(Vec::len).sum()
            };
            tracing::info!(warm = total_warm, "sandbox pool started");
        }

        let pool = self.clone();
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.cleanup_idle_sandboxes().await;
            }
        });
        *self.maintenance.lock() = Some(handle);
    }

    /// Stop the maintenance task and terminate every sandbox.
    pub async fn stop(self: &Arc<Self>) {
        tracing::info!("stopping sandbox pool");
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        let ids: Vec<String> = {
            let mut inner = self.inner.lock();
            let ids = inner
                .active
                .keys()
                .cloned()
                .chain(inner.warm.values().flatten().map(|s| s.id.clone()))
                .collect();
            *inner = PoolInner::default();
            ids
        };
        for id in ids {
            if let Err(e) = self.provider.delete(&id).await {
                tracing::error!(sandbox_id = %id, error = %e, "failed to terminate sandbox on shutdown");
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        let warm_web = inner.warm_count(AppType::Web);
        let warm_mobile = inner.warm_count(AppType::Mobile);
        let active = inner.active.len();
        let avg_requests = if inner.metrics.is_empty() {
            0.0
        } else {
            inner.metrics.values().map(|m| m.total_requests).sum::<u64>() as f64
                / inner.metrics.len() as f64
        };
        PoolStatus {
            active_sandboxes: active,
            warm_sandboxes: warm_web + warm_mobile,
            warm_web_sandboxes: warm_web,
            warm_mobile_sandboxes: warm_mobile,
            total_sandboxes: inner.total(),
            max_sandboxes: self.config.max_total_sandboxes,
            utilization: active as f64 / self.config.max_total_sandboxes as f64,
            avg_requests_per_sandbox: avg_requests,
        }
    }

    /// Invariant check used by tests: the user↔sandbox maps are exact
    /// inverses.
    pub fn maps_are_bidirectional(&self) -> bool {
        let inner = self.inner.lock();
        inner.user_sandboxes.len() == inner.sandbox_users.len()
            && inner.user_sandboxes.iter().all(|(user, sb)| {
                inner.sandbox_users.get(sb).map(String::as_str) == Some(user.as_str())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubProvider;
    use kiln_coordination::MemoryStore;

    fn snapshots() -> SnapshotNames {
        SnapshotNames {
            web: "web-snap".into(),
            mobile: "mobile-snap".into(),
        }
    }

    fn fast_timing() -> (CreateRetryPolicy, ReadinessPolicy) {
        (
            CreateRetryPolicy {
                attempt_timeout: Duration::from_millis(500),
                backoffs: vec![Duration::from_millis(5), Duration::from_millis(10)],
            },
            ReadinessPolicy {
                initial_interval: Duration::from_millis(5),
                slow_interval: Duration::from_millis(10),
                slow_after_polls: 3,
                max_wait: Duration::from_millis(500),
            },
        )
    }

    fn pool_with(provider: StubProvider, config: PoolSettings) -> Arc<SandboxPool> {
        let locks = Arc::new(LockManager::new(Arc::new(MemoryStore::new())));
        let (create, ready) = fast_timing();
        Arc::new(
            SandboxPool::new(
                Arc::new(provider),
                locks,
                config,
                snapshots(),
                "inst-1".into(),
            )
            .with_timing(create, ready),
        )
    }

    fn small_config() -> PoolSettings {
        PoolSettings {
            min_warm_sandboxes: 1,
            max_total_sandboxes: 3,
            ..PoolSettings::default()
        }
    }

    #[tokio::test]
    async fn same_user_reuses_the_same_sandbox() {
        let pool = pool_with(StubProvider::new(), small_config());
        let first = pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();
        let second = pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(pool.maps_are_bidirectional());
    }

    #[tokio::test]
    async fn distinct_users_get_distinct_sandboxes() {
        let pool = pool_with(StubProvider::new(), small_config());
        let a = pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();
        let b = pool.get_sandbox_for_user("u2", "p2", AppType::Web).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(pool.maps_are_bidirectional());
    }

    #[tokio::test]
    async fn warm_pool_is_consumed_before_creating() {
        let pool = pool_with(StubProvider::new(), small_config());
        pool.ensure_warm().await;
        let warm_before = pool.status().warm_sandboxes;
        assert!(warm_before >= 1);

        let info = pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();
        let status = pool.status();
        assert_eq!(status.warm_web_sandboxes, warm_before - status.warm_mobile_sandboxes - 1);
        assert_eq!(status.active_sandboxes, 1);
        assert!(!info.id.is_empty());
    }

    #[tokio::test]
    async fn warm_pools_are_partitioned_by_app_type() {
        let pool = pool_with(StubProvider::new(), small_config());
        pool.ensure_warm().await;
        let status = pool.status();
        assert_eq!(status.warm_web_sandboxes, 1);
        assert_eq!(status.warm_mobile_sandboxes, 1);
    }

    #[tokio::test]
    async fn capacity_exhaustion_is_an_error() {
        let config = PoolSettings {
            min_warm_sandboxes: 0,
            max_total_sandboxes: 2,
            ..PoolSettings::default()
        };
        let pool = pool_with(StubProvider::new(), config);
        pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();
        pool.get_sandbox_for_user("u2", "p2", AppType::Web).await.unwrap();

        let err = pool
            .get_sandbox_for_user("u3", "p3", AppType::Web)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn release_below_warm_minimum_resets_and_rewards() {
        let provider = StubProvider::new();
        let pool = pool_with(provider.clone(), small_config());
        let info = pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();

        pool.release_sandbox("u1", true).await.unwrap();
        let status = pool.status();
        assert_eq!(status.active_sandboxes, 0);
        assert_eq!(status.warm_web_sandboxes, 1);
        assert!(pool.maps_are_bidirectional());

        // The reset ran the git and process cleanup inside the sandbox.
        let commands: Vec<String> = provider
            .exec_log()
            .into_iter()
            .filter(|(id, _)| id == &info.id)
            .map(|(_, cmd)| cmd)
            .collect();
        assert!(commands.iter().any(|c| c.contains("git checkout")));
        assert!(commands.iter().any(|c| c.contains("git clean")));
        assert!(commands.iter().any(|c| c.contains("pkill")));
    }

    #[tokio::test]
    async fn release_above_warm_minimum_terminates() {
        let provider = StubProvider::new();
        let config = PoolSettings {
            min_warm_sandboxes: 0,
            max_total_sandboxes: 5,
            ..PoolSettings::default()
        };
        let pool = pool_with(provider.clone(), config);
        let info = pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();

        pool.release_sandbox("u1", true).await.unwrap();
        assert!(provider.get(&info.id).await.is_err());
        assert_eq!(pool.status().total_sandboxes, 0);
    }

    #[tokio::test]
    async fn release_unknown_user_is_a_noop() {
        let pool = pool_with(StubProvider::new(), small_config());
        pool.release_sandbox("ghost", true).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_user_converge() {
        let pool = pool_with(StubProvider::new(), small_config());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.get_sandbox_for_user("u1", "p1", AppType::Web).await
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for h in handles {
            if let Ok(info) = h.await.unwrap() {
                ids.insert(info.id);
            }
        }
        // Whatever subset won the allocation lock, they all saw one
        // sandbox.
        assert_eq!(ids.len(), 1);
        assert!(pool.maps_are_bidirectional());
    }

    #[tokio::test]
    async fn idle_sandboxes_are_released_by_maintenance() {
        let config = PoolSettings {
            min_warm_sandboxes: 0,
            max_idle_time: Duration::from_millis(0),
            ..small_config()
        };
        let provider = StubProvider::new();
        let pool = pool_with(provider.clone(), config);
        pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.cleanup_idle_sandboxes().await;

        let status = pool.status();
        assert_eq!(status.active_sandboxes, 0);
        assert_eq!(status.total_sandboxes, 0);
        assert!(pool.maps_are_bidirectional());
    }

    #[tokio::test]
    async fn stop_terminates_everything() {
        let provider = StubProvider::new();
        let pool = pool_with(provider.clone(), small_config());
        pool.ensure_warm().await;
        pool.get_sandbox_for_user("u1", "p1", AppType::Web).await.unwrap();

        pool.stop().await;
        assert_eq!(pool.status().total_sandboxes, 0);
        assert!(provider.list().await.unwrap().is_empty());
    }
}
