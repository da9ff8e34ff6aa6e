use std::sync::Arc;

use kiln_billing::Ledger;
use kiln_coordination::{CoordStore, JobQueue, LockManager};
use kiln_domain::config::Config;
use kiln_domain::stream::AgentEngine;
use kiln_sandbox::SandboxPool;
use kiln_store::Database;

use crate::runtime::keys::KeyResolver;

/// Shared application state passed to all API handlers and workers.
///
/// Constructed once at process start by [`crate::bootstrap`], in
/// dependency order; teardown runs in reverse. Nothing here is a global
/// — every resource is owned by this struct and passed down the call
/// graph.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Stores ───────────────────────────────────────────────────────
    /// Durable state: projects, threads, runs, billing.
    pub db: Arc<dyn Database>,
    /// Transient state: locks, stream logs, pub/sub, caches.
    pub coord: Arc<dyn CoordStore>,

    // ── Orchestration ────────────────────────────────────────────────
    pub queue: Arc<dyn JobQueue>,
    pub pool: Arc<SandboxPool>,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<dyn AgentEngine>,
    pub locks: Arc<LockManager>,
    pub keys: Arc<KeyResolver>,

    // ── Identity ─────────────────────────────────────────────────────
    /// Short unique id for this process; embedded in lock values and
    /// liveness keys.
    pub instance_id: String,
    /// SHA-256 of the admin API key; `None` = dev mode.
    pub admin_key_hash: Option<Vec<u8>>,
}
