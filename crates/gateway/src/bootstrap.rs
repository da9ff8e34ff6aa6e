//! AppState construction and background-task wiring.
//!
//! Resources are built in dependency order — coordination store, durable
//! store, locks, pricing, ledger, key resolver, sandbox provider, pool,
//! engine, queue — and torn down in reverse by [`shutdown`].

use std::sync::Arc;

use kiln_billing::{Ledger, PricingCatalog};
use kiln_coordination::sweeper::{self, SweeperConfig};
use kiln_coordination::{keys, CoordStore, JobQueue, LockManager, MemoryJobQueue, MemoryStore};
use kiln_domain::config::{Config, ConfigSeverity};
use kiln_domain::stream::ControlSignal;
use kiln_sandbox::http::HttpProvider;
use kiln_sandbox::provider::SandboxProvider;
use kiln_sandbox::{SandboxPool, SnapshotNames, StubProvider};
use kiln_store::{Database, KeyVault, MemoryDatabase};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::runtime::engine::ChatEngine;
use crate::runtime::keys::KeyResolver;
use crate::state::AppState;

const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const OPENROUTER_MODELS_URL: &str = "https://openrouter.ai/api/v1/models";

/// Validate config and wire every subsystem into a ready [`AppState`].
pub async fn build_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let instance_id = Uuid::new_v4().simple().to_string()[..8].to_owned();
    tracing::info!(instance_id, "initializing kiln gateway");

    let coord: Arc<dyn CoordStore> = Arc::new(MemoryStore::new());
    let db: Arc<dyn Database> = Arc::new(MemoryDatabase::new());
    let locks = Arc::new(LockManager::new(coord.clone()));

    let pricing = Arc::new(PricingCatalog::new(
        coord.clone(),
        Some(OPENROUTER_MODELS_URL.to_owned()),
    ));
    let ledger = Arc::new(Ledger::new(db.clone(), coord.clone(), pricing));

    let vault = config
        .master_key
        .as_deref()
        .map(|secret| Arc::new(KeyVault::new(secret)));
    let key_resolver = Arc::new(KeyResolver::new(
        db.clone(),
        vault,
        ledger.clone(),
        config.openrouter_api_key.clone(),
    ));

    let provider: Arc<dyn SandboxProvider> =
        match (&config.sandbox_server_url, &config.sandbox_api_key) {
            (Some(url), Some(key)) => {
                tracing::info!(url, "using HTTP sandbox provider");
                Arc::new(HttpProvider::new(url.clone(), key.clone()))
            }
            _ => {
                tracing::warn!("sandbox provider not configured, using stub provider");
                Arc::new(StubProvider::new())
            }
        };
    let pool = Arc::new(SandboxPool::new(
        provider,
        locks.clone(),
        config.pool.clone(),
        SnapshotNames {
            web: config.sandbox_snapshot_name.clone(),
            mobile: config.mobile_sandbox_snapshot_name.clone(),
        },
        instance_id.clone(),
    ));

    let engine = Arc::new(ChatEngine::new(
        OPENROUTER_CHAT_URL,
        key_resolver.clone(),
        ledger.clone(),
    ));
    let admin_key_hash = config
        .admin_api_key
        .as_ref()
        .map(|key| Sha256::digest(key.as_bytes()).to_vec());

    Ok(AppState {
        config,
        db,
        coord,
        queue: Arc::new(MemoryJobQueue::new()),
        pool,
        ledger,
        engine,
        locks,
        keys: key_resolver,
        instance_id,
        admin_key_hash,
    })
}

/// Spawn the background machinery: the stale-lock sweeper and the
/// sandbox pool (warm-up + idle maintenance).
pub fn spawn_background(state: &AppState) -> Vec<JoinHandle<()>> {
    let mut handles = vec![sweeper::spawn(state.coord.clone(), SweeperConfig::default())];

    let pool = state.pool.clone();
    handles.push(tokio::spawn(async move {
        pool.start().await;
    }));

    handles
}

/// Graceful teardown, reverse of construction: stop accepting work,
/// signal this instance's in-flight runs to stop, then drain the pool.
pub async fn shutdown(state: &AppState) {
    tracing::info!(instance_id = %state.instance_id, "shutting down");
    state.queue.close();

    // Ask every run this instance still owns to stop.
    match state
        .coord
        .scan(&keys::active_run_pattern(&state.instance_id))
        .await
    {
        Ok(active) => {
            for key in active {
                let Some(run_id) = key
                    .rsplit(':')
                    .next()
                    .and_then(|id| Uuid::parse_str(id).ok())
                else {
                    continue;
                };
                tracing::info!(%run_id, "signalling active run to stop for shutdown");
                let _ = state
                    .coord
                    .publish(
                        &keys::run_control_for_instance(run_id, &state.instance_id),
                        ControlSignal::Stop.as_wire(),
                    )
                    .await;
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to scan active runs during shutdown"),
    }

    state.pool.stop().await;
    tracing::info!("shutdown complete");
}
