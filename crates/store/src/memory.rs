//! In-memory durable store.
//!
//! Backs tests and single-node deployments. The token debit runs under
//! one write lock, which is exactly the "single conditional update"
//! the contract demands — concurrent debits linearize.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kiln_domain::entities::{
    BillingCustomer, Message, Project, SandboxDescriptor, Thread, TokenUsageRecord, UserLlmKey,
};
use kiln_domain::plans::{self, PlanId};
use kiln_domain::run::{AgentRun, RunStatus};
use kiln_domain::Result;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::db::{Database, DebitOutcome};

#[derive(Default)]
struct Inner {
    projects: HashMap<Uuid, Project>,
    threads: HashMap<Uuid, Thread>,
    messages: HashMap<Uuid, Vec<Message>>,
    runs: HashMap<Uuid, AgentRun>,
    billing: HashMap<String, BillingCustomer>,
    usage: Vec<TokenUsageRecord>,
    user_keys: Vec<UserLlmKey>,
}

#[derive(Default)]
pub struct MemoryDatabase {
    inner: RwLock<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_billing(account_id: &str) -> BillingCustomer {
    let plan = plans::plan(PlanId::Free);
    let quota = plan.token_quota.unwrap_or(0);
    BillingCustomer {
        account_id: account_id.to_owned(),
        plan_id: PlanId::Free,
        token_quota_total: quota,
        token_quota_remaining: quota,
        quota_resets_at: Utc::now() + Duration::days(30),
        email: None,
        active: true,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn insert_project(&self, project: Project) -> Result<()> {
        self.inner.write().projects.insert(project.project_id, project);
        Ok(())
    }

    async fn get_project(&self, project_id: Uuid) -> Result<Option<Project>> {
        Ok(self.inner.read().projects.get(&project_id).cloned())
    }

    async fn list_projects(&self, account_id: &str) -> Result<Vec<Project>> {
        let inner = self.inner.read();
        let mut projects: Vec<Project> = inner
            .projects
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    async fn set_project_name(&self, project_id: Uuid, name: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.projects.get_mut(&project_id) {
            Some(p) => {
                p.name = name.to_owned();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_project_sandbox(
        &self,
        project_id: Uuid,
        sandbox: SandboxDescriptor,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        match inner.projects.get_mut(&project_id) {
            Some(p) => {
                p.sandbox = Some(sandbox);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_project(&self, project_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.projects.remove(&project_id).is_none() {
            return Ok(false);
        }
        let thread_ids: Vec<Uuid> = inner
            .threads
            .values()
            .filter(|t| t.project_id == project_id)
            .map(|t| t.thread_id)
            .collect();
        for tid in thread_ids {
            inner.threads.remove(&tid);
            inner.messages.remove(&tid);
            inner.runs.retain(|_, r| r.thread_id != tid);
        }
        Ok(true)
    }

    async fn insert_thread(&self, thread: Thread) -> Result<()> {
        self.inner.write().threads.insert(thread.thread_id, thread);
        Ok(())
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>> {
        Ok(self.inner.read().threads.get(&thread_id).cloned())
    }

    async fn list_threads(&self, account_id: &str) -> Result<Vec<Thread>> {
        let inner = self.inner.read();
        let mut threads: Vec<Thread> = inner
            .threads
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(threads)
    }

    async fn list_threads_for_project(&self, project_id: Uuid) -> Result<Vec<Thread>> {
        let inner = self.inner.read();
        let mut threads: Vec<Thread> = inner
            .threads
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(threads)
    }

    async fn insert_message(&self, message: Message) -> Result<()> {
        self.inner
            .write()
            .messages
            .entry(message.thread_id)
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        let inner = self.inner.read();
        let mut messages = inner.messages.get(&thread_id).cloned().unwrap_or_default();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.message_id.cmp(&b.message_id))
        });
        Ok(messages)
    }

    async fn insert_run(&self, run: AgentRun) -> Result<()> {
        self.inner.write().runs.insert(run.run_id, run);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<AgentRun>> {
        Ok(self.inner.read().runs.get(&run_id).cloned())
    }

    async fn list_runs_for_thread(&self, thread_id: Uuid) -> Result<Vec<AgentRun>> {
        let inner = self.inner.read();
        let mut runs: Vec<AgentRun> = inner
            .runs
            .values()
            .filter(|r| r.thread_id == thread_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    async fn active_run_for_project(&self, project_id: Uuid) -> Result<Option<Uuid>> {
        let inner = self.inner.read();
        let thread_ids: Vec<Uuid> = inner
            .threads
            .values()
            .filter(|t| t.project_id == project_id)
            .map(|t| t.thread_id)
            .collect();
        Ok(inner
            .runs
            .values()
            .filter(|r| r.status.is_active() && thread_ids.contains(&r.thread_id))
            .map(|r| r.run_id)
            .next())
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        responses: Option<Vec<serde_json::Value>>,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(run) = inner.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if !run.status.may_transition_to(status) {
            tracing::debug!(
                %run_id,
                from = run.status.as_str(),
                to = status.as_str(),
                "refusing run status transition"
            );
            return Ok(false);
        }
        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(Utc::now());
        }
        if let Some(error) = error {
            run.error = Some(error);
        }
        if let Some(responses) = responses {
            run.responses = responses;
        }
        Ok(true)
    }

    async fn get_or_create_billing(&self, account_id: &str) -> Result<BillingCustomer> {
        let mut inner = self.inner.write();
        Ok(inner
            .billing
            .entry(account_id.to_owned())
            .or_insert_with(|| new_billing(account_id))
            .clone())
    }

    async fn get_billing(&self, account_id: &str) -> Result<Option<BillingCustomer>> {
        Ok(self.inner.read().billing.get(account_id).cloned())
    }

    async fn debit_tokens(&self, account_id: &str, tokens: i64) -> Result<DebitOutcome> {
        let mut inner = self.inner.write();
        let customer = inner
            .billing
            .entry(account_id.to_owned())
            .or_insert_with(|| new_billing(account_id));
        if customer.token_quota_remaining >= tokens {
            customer.token_quota_remaining -= tokens;
            Ok(DebitOutcome::Debited {
                remaining: customer.token_quota_remaining,
            })
        } else {
            Ok(DebitOutcome::Insufficient {
                remaining: customer.token_quota_remaining,
            })
        }
    }

    async fn set_plan(&self, account_id: &str, plan: PlanId) -> Result<BillingCustomer> {
        let mut inner = self.inner.write();
        let customer = inner
            .billing
            .entry(account_id.to_owned())
            .or_insert_with(|| new_billing(account_id));
        let quota = plans::plan(plan).token_quota.unwrap_or(0);
        customer.plan_id = plan;
        customer.token_quota_total = quota;
        customer.token_quota_remaining = quota;
        customer.quota_resets_at = Utc::now() + Duration::days(30);
        Ok(customer.clone())
    }

    async fn reset_quota(&self, account_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(customer) = inner.billing.get_mut(account_id) else {
            return Ok(false);
        };
        customer.token_quota_remaining = customer.token_quota_total;
        customer.quota_resets_at = Utc::now() + Duration::days(30);
        Ok(true)
    }

    async fn insert_usage(&self, record: TokenUsageRecord) -> Result<()> {
        self.inner.write().usage.push(record);
        Ok(())
    }

    async fn usage_history(&self, account_id: &str, days: i64) -> Result<Vec<TokenUsageRecord>> {
        let cutoff = Utc::now() - Duration::days(days);
        let inner = self.inner.read();
        let mut records: Vec<TokenUsageRecord> = inner
            .usage
            .iter()
            .filter(|u| u.account_id == account_id && u.created_at >= cutoff)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn upsert_user_key(&self, key: UserLlmKey) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .user_keys
            .retain(|k| !(k.account_id == key.account_id && k.provider == key.provider));
        inner.user_keys.push(key);
        Ok(())
    }

    async fn active_user_key(
        &self,
        account_id: &str,
        provider: &str,
    ) -> Result<Option<UserLlmKey>> {
        Ok(self
            .inner
            .read()
            .user_keys
            .iter()
            .find(|k| k.account_id == account_id && k.provider == provider && k.active)
            .cloned())
    }

    async fn deactivate_user_key(&self, account_id: &str, key_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write();
        for key in inner.user_keys.iter_mut() {
            if key.account_id == account_id && key.key_id == key_id && key.active {
                key.active = false;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_domain::entities::{AppType, EncryptedSecret, MessageKind};
    use kiln_domain::run::RunMetadata;
    use std::sync::Arc;

    fn run_for(thread_id: Uuid) -> AgentRun {
        AgentRun::new(
            thread_id,
            RunMetadata {
                model: "m".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn project_cascade_delete() {
        let db = MemoryDatabase::new();
        let project = Project::new("acc", "p", AppType::Web);
        let pid = project.project_id;
        db.insert_project(project).await.unwrap();

        let thread = Thread::new(pid, "acc");
        let tid = thread.thread_id;
        db.insert_thread(thread).await.unwrap();
        db.insert_message(Message::new(tid, MessageKind::User, serde_json::json!("hi")))
            .await
            .unwrap();
        let run = run_for(tid);
        let rid = run.run_id;
        db.insert_run(run).await.unwrap();

        assert!(db.delete_project(pid).await.unwrap());
        assert!(db.get_thread(tid).await.unwrap().is_none());
        assert!(db.list_messages(tid).await.unwrap().is_empty());
        assert!(db.get_run(rid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn message_total_order() {
        let db = MemoryDatabase::new();
        let tid = Uuid::new_v4();
        let now = Utc::now();
        // Two messages at the same instant — order falls back to id.
        let mut a = Message::new(tid, MessageKind::User, serde_json::json!("a"));
        let mut b = Message::new(tid, MessageKind::Assistant, serde_json::json!("b"));
        a.created_at = now;
        b.created_at = now;
        db.insert_message(b.clone()).await.unwrap();
        db.insert_message(a.clone()).await.unwrap();

        let ordered = db.list_messages(tid).await.unwrap();
        assert_eq!(ordered.len(), 2);
        assert!(ordered[0].message_id < ordered[1].message_id);
    }

    #[tokio::test]
    async fn active_run_lookup_spans_project_threads() {
        let db = MemoryDatabase::new();
        let project = Project::new("acc", "p", AppType::Web);
        let pid = project.project_id;
        db.insert_project(project).await.unwrap();

        let t1 = Thread::new(pid, "acc");
        let t2 = Thread::new(pid, "acc");
        db.insert_thread(t1.clone()).await.unwrap();
        db.insert_thread(t2.clone()).await.unwrap();

        assert!(db.active_run_for_project(pid).await.unwrap().is_none());

        let run = run_for(t2.thread_id);
        let rid = run.run_id;
        db.insert_run(run).await.unwrap();
        assert_eq!(db.active_run_for_project(pid).await.unwrap(), Some(rid));

        db.update_run_status(rid, RunStatus::Completed, None, None)
            .await
            .unwrap();
        assert!(db.active_run_for_project(pid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_status_is_never_overwritten() {
        let db = MemoryDatabase::new();
        let run = run_for(Uuid::new_v4());
        let rid = run.run_id;
        db.insert_run(run).await.unwrap();

        assert!(db
            .update_run_status(rid, RunStatus::Stopped, None, None)
            .await
            .unwrap());
        // A late "stopping" write from the dispatcher must be refused.
        assert!(!db
            .update_run_status(rid, RunStatus::Stopping, None, None)
            .await
            .unwrap());
        assert_eq!(db.get_run(rid).await.unwrap().unwrap().status, RunStatus::Stopped);
        assert!(db.get_run(rid).await.unwrap().unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn debit_exact_balance_reaches_zero() {
        let db = MemoryDatabase::new();
        db.get_or_create_billing("acc").await.unwrap();
        let outcome = db.debit_tokens("acc", 100_000).await.unwrap();
        assert_eq!(outcome, DebitOutcome::Debited { remaining: 0 });
    }

    #[tokio::test]
    async fn debit_one_over_balance_is_rejected_without_write() {
        let db = MemoryDatabase::new();
        db.get_or_create_billing("acc").await.unwrap();
        let outcome = db.debit_tokens("acc", 100_001).await.unwrap();
        assert_eq!(outcome, DebitOutcome::Insufficient { remaining: 100_000 });
        let billing = db.get_billing("acc").await.unwrap().unwrap();
        assert_eq!(billing.token_quota_remaining, 100_000);
    }

    #[tokio::test]
    async fn concurrent_debits_never_lose_updates() {
        let db = Arc::new(MemoryDatabase::new());
        db.get_or_create_billing("acc").await.unwrap();

        // 60 concurrent debits of 2_000 against a 100_000 balance:
        // exactly 50 must succeed, and the final balance must be 0.
        let mut handles = Vec::new();
        for _ in 0..60 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.debit_tokens("acc", 2_000).await.unwrap()
            }));
        }
        let mut succeeded = 0;
        for h in handles {
            if matches!(h.await.unwrap(), DebitOutcome::Debited { .. }) {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 50);
        let billing = db.get_billing("acc").await.unwrap().unwrap();
        assert_eq!(billing.token_quota_remaining, 0);
    }

    #[tokio::test]
    async fn plan_change_resets_quotas() {
        let db = MemoryDatabase::new();
        db.get_or_create_billing("acc").await.unwrap();
        db.debit_tokens("acc", 50_000).await.unwrap();

        let customer = db.set_plan("acc", PlanId::Pro).await.unwrap();
        assert_eq!(customer.plan_id, PlanId::Pro);
        assert_eq!(customer.token_quota_total, 750_000);
        assert_eq!(customer.token_quota_remaining, 750_000);
    }

    #[tokio::test]
    async fn quota_reset_restores_full_balance() {
        let db = MemoryDatabase::new();
        db.get_or_create_billing("acc").await.unwrap();
        db.debit_tokens("acc", 99_000).await.unwrap();
        assert!(db.reset_quota("acc").await.unwrap());
        let billing = db.get_billing("acc").await.unwrap().unwrap();
        assert_eq!(billing.token_quota_remaining, 100_000);
        assert!(!db.reset_quota("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn user_key_deactivation_is_conditional_on_id() {
        let db = MemoryDatabase::new();
        let key = UserLlmKey {
            key_id: Uuid::new_v4(),
            account_id: "acc".into(),
            provider: "openrouter".into(),
            encrypted_key: EncryptedSecret {
                nonce: "n".into(),
                ciphertext: "c".into(),
            },
            active: true,
            created_at: Utc::now(),
        };
        let old_id = key.key_id;
        db.upsert_user_key(key.clone()).await.unwrap();

        // User replaces the key; deactivating the old id must not touch it.
        let replacement = UserLlmKey {
            key_id: Uuid::new_v4(),
            ..key
        };
        db.upsert_user_key(replacement.clone()).await.unwrap();

        assert!(!db.deactivate_user_key("acc", old_id).await.unwrap());
        let active = db.active_user_key("acc", "openrouter").await.unwrap().unwrap();
        assert_eq!(active.key_id, replacement.key_id);

        assert!(db.deactivate_user_key("acc", replacement.key_id).await.unwrap());
        assert!(db.active_user_key("acc", "openrouter").await.unwrap().is_none());
    }
}
