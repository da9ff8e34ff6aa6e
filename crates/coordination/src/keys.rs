//! Key and channel namespace. Every format string lives here so the
//! layout of the keyspace is visible in one place.

use uuid::Uuid;

/// Execution-ownership lock for one run. Value is `{owner}:{unix_secs}`.
pub fn run_lock(run_id: Uuid) -> String {
    format!("agent_run_lock:{run_id}")
}

/// Append-only list of serialized stream items.
pub fn run_responses(run_id: Uuid) -> String {
    format!("agent_run:{run_id}:responses")
}

/// Pub/sub channel notified with [`RESPONSE_NOTIFY`] after each append.
pub fn run_new_response(run_id: Uuid) -> String {
    format!("agent_run:{run_id}:new_response")
}

/// Global control channel; messages are STOP / END_STREAM / ERROR.
pub fn run_control(run_id: Uuid) -> String {
    format!("agent_run:{run_id}:control")
}

/// Instance-targeted control channel variant.
pub fn run_control_for_instance(run_id: Uuid, instance_id: &str) -> String {
    format!("agent_run:{run_id}:control:{instance_id}")
}

/// Liveness marker for a run being executed by a specific instance.
pub fn active_run(instance_id: &str, run_id: Uuid) -> String {
    format!("active_run:{instance_id}:{run_id}")
}

/// Scan pattern for all of one instance's liveness markers.
pub fn active_run_pattern(instance_id: &str) -> String {
    format!("active_run:{instance_id}:*")
}

/// Serialized transient status record for polling endpoints.
pub fn task_status(run_id: Uuid) -> String {
    format!("task_status:{run_id}")
}

/// Mutual exclusion for sandbox lifecycle transitions.
pub fn sandbox_state_lock(sandbox_id: &str) -> String {
    format!("sandbox_state_lock:{sandbox_id}")
}

/// Mutual exclusion for per-user sandbox allocation.
pub fn sandbox_allocation_lock(user_id: &str) -> String {
    format!("sandbox_allocation_lock:{user_id}")
}

/// Cached plan id per account (TTL 5 min).
pub fn user_plan(account_id: &str) -> String {
    format!("user_plan:{account_id}")
}

/// Cached pricing catalog (TTL 6 h).
pub const PRICING_CATALOG: &str = "openrouter:models:pricing";

/// Message published on the new-response channel after each append.
pub const RESPONSE_NOTIFY: &str = "new";

/// Scan pattern the stale-lock sweeper walks.
pub const RUN_LOCK_PATTERN: &str = "agent_run_lock:*";
