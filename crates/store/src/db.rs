//! The durable-store contract.

use async_trait::async_trait;
use kiln_domain::entities::{
    BillingCustomer, Message, Project, SandboxDescriptor, Thread, TokenUsageRecord, UserLlmKey,
};
use kiln_domain::plans::PlanId;
use kiln_domain::run::{AgentRun, RunStatus};
use kiln_domain::Result;
use uuid::Uuid;

/// Result of an atomic token debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    /// The balance covered the debit; `remaining` is the new balance.
    Debited { remaining: i64 },
    /// The debit would have driven the balance negative. No state
    /// changed; `remaining` is the untouched balance.
    Insufficient { remaining: i64 },
}

/// Storage operations over the durable tables.
///
/// `debit_tokens` MUST be a single conditional update of the form
/// `remaining = remaining - n WHERE remaining >= n`. Backends that
/// cannot provide that atomically must return an error rather than
/// emulate it with a read-check-write sequence — concurrent debits for
/// the same account have to serialize at the storage layer with no lost
/// updates.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Projects ─────────────────────────────────────────────────────
    async fn insert_project(&self, project: Project) -> Result<()>;
    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>>;
    async fn list_projects(&self, account_id: &str) -> Result<Vec<Project>>;
    async fn set_project_name(&self, project_id: Uuid, name: &str) -> Result<bool>;
    async fn set_project_sandbox(
        &self,
        project_id: Uuid,
        sandbox: SandboxDescriptor,
    ) -> Result<bool>;
    /// Cascades to the project's threads, their messages and runs.
    async fn delete_project(&self, project_id: Uuid) -> Result<bool>;

    // ── Threads ──────────────────────────────────────────────────────
    async fn insert_thread(&self, thread: Thread) -> Result<()>;
    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>>;
    async fn list_threads(&self, account_id: &str) -> Result<Vec<Thread>>;
    async fn list_threads_for_project(&self, project_id: Uuid) -> Result<Vec<Thread>>;

    // ── Messages ─────────────────────────────────────────────────────
    async fn insert_message(&self, message: Message) -> Result<()>;
    /// Ordered by `(created_at, message_id)` — the order shown to the LLM.
    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>>;

    // ── Agent runs ───────────────────────────────────────────────────
    async fn insert_run(&self, run: AgentRun) -> Result<()>;
    async fn get_run(&self, run_id: Uuid) -> Result<Option<AgentRun>>;
    /// Newest first.
    async fn list_runs_for_thread(&self, thread_id: Uuid) -> Result<Vec<AgentRun>>;
    /// A run in `{queued, running}` on any thread of the project.
    async fn active_run_for_project(&self, project_id: Uuid) -> Result<Option<Uuid>>;
    /// Guarded status update: refused (returns false) when the current
    /// status does not admit the transition, so a terminal status can
    /// never be overwritten. Terminal transitions stamp `completed_at`.
    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        responses: Option<Vec<serde_json::Value>>,
    ) -> Result<bool>;

    // ── Billing ──────────────────────────────────────────────────────
    async fn get_or_create_billing(&self, account_id: &str) -> Result<BillingCustomer>;
    async fn get_billing(&self, account_id: &str) -> Result<Option<BillingCustomer>>;
    async fn debit_tokens(&self, account_id: &str, tokens: i64) -> Result<DebitOutcome>;
    /// Plan changes reset both quota totals.
    async fn set_plan(&self, account_id: &str, plan: PlanId) -> Result<BillingCustomer>;
    /// Restore remaining to the plan total and push the reset date out
    /// 30 days.
    async fn reset_quota(&self, account_id: &str) -> Result<bool>;

    // ── Usage log (append-only) ──────────────────────────────────────
    async fn insert_usage(&self, record: TokenUsageRecord) -> Result<()>;
    async fn usage_history(&self, account_id: &str, days: i64) -> Result<Vec<TokenUsageRecord>>;

    // ── User LLM keys ────────────────────────────────────────────────
    async fn upsert_user_key(&self, key: UserLlmKey) -> Result<()>;
    async fn active_user_key(&self, account_id: &str, provider: &str)
        -> Result<Option<UserLlmKey>>;
    /// Conditional on the key id so a concurrent re-upload of a new key
    /// is not clobbered. Returns false when the key was already gone or
    /// inactive.
    async fn deactivate_user_key(&self, account_id: &str, key_id: Uuid) -> Result<bool>;
}
