//! The quota ledger.
//!
//! All reasoning is in tokens; credits are derived at the edges for
//! display. The debit itself is delegated to the durable store's atomic
//! conditional update, so concurrent consumption for one account
//! serializes with no lost updates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_coordination::{keys, CoordStore, SetMode};
use kiln_domain::entities::TokenUsageRecord;
use kiln_domain::plans::{
    self, credits_from_tokens, PlanId, MIN_CONVERSATION_TOKENS,
};
use kiln_domain::{Error, Result};
use kiln_store::{Database, DebitOutcome};
use serde::Serialize;
use uuid::Uuid;

use crate::pricing::PricingCatalog;

const PLAN_CACHE_TTL: Duration = Duration::from_secs(300);

/// Successful consumption receipt.
#[derive(Debug, Clone, Serialize)]
pub struct Consumption {
    pub tokens_consumed: i64,
    pub tokens_remaining: i64,
    /// `-1` means unlimited (BYOK).
    pub credits_remaining: i64,
    pub plan_id: PlanId,
    pub byok_unlimited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub account_id: String,
    pub plan: PlanId,
    pub plan_name: &'static str,
    pub tokens_remaining: i64,
    pub tokens_total: i64,
    /// `-1` means unlimited (BYOK).
    pub credits_remaining: i64,
    pub credits_total: i64,
    pub quota_resets_at: DateTime<Utc>,
}

pub struct Ledger {
    db: Arc<dyn Database>,
    coord: Arc<dyn CoordStore>,
    pricing: Arc<PricingCatalog>,
}

impl Ledger {
    pub fn new(
        db: Arc<dyn Database>,
        coord: Arc<dyn CoordStore>,
        pricing: Arc<PricingCatalog>,
    ) -> Self {
        Self { db, coord, pricing }
    }

    /// Atomically debit `tokens` from the account's allowance and record
    /// the usage. BYOK plans are never debited; their usage is logged
    /// with the real upstream cost when the pricing catalog knows the
    /// model.
    pub async fn consume_tokens(
        &self,
        account_id: &str,
        tokens: i64,
        model: &str,
        thread_id: Option<Uuid>,
        message_id: Option<Uuid>,
    ) -> Result<Consumption> {
        if tokens <= 0 {
            return Err(Error::ClientInput(format!(
                "token amount must be positive, got {tokens}"
            )));
        }

        let billing = self.db.get_or_create_billing(account_id).await?;

        // Only a total is known at this point; split half/half for the
        // per-direction columns.
        let prompt_tokens = tokens / 2;
        let completion_tokens = tokens - prompt_tokens;

        if billing.plan_id == PlanId::Byok {
            let real_cost = self
                .pricing
                .estimate_cost(model, prompt_tokens, completion_tokens)
                .await;
            let estimated_cost = real_cost.unwrap_or_else(|| {
                plans::estimate_token_cost(prompt_tokens, completion_tokens, model)
            });
            self.log_usage(
                account_id,
                thread_id,
                message_id,
                model,
                prompt_tokens,
                completion_tokens,
                billing.token_quota_remaining,
                estimated_cost,
                real_cost.is_some(),
            )
            .await?;
            return Ok(Consumption {
                tokens_consumed: tokens,
                tokens_remaining: billing.token_quota_remaining,
                credits_remaining: -1,
                plan_id: PlanId::Byok,
                byok_unlimited: true,
            });
        }

        match self.db.debit_tokens(account_id, tokens).await? {
            DebitOutcome::Debited { remaining } => {
                let cost = plans::estimate_token_cost(prompt_tokens, completion_tokens, model);
                self.log_usage(
                    account_id,
                    thread_id,
                    message_id,
                    model,
                    prompt_tokens,
                    completion_tokens,
                    remaining,
                    cost,
                    false,
                )
                .await?;
                let credits = credits_from_tokens(remaining);
                tracing::info!(
                    account_id,
                    tokens,
                    remaining,
                    credits,
                    "consumed tokens"
                );
                Ok(Consumption {
                    tokens_consumed: tokens,
                    tokens_remaining: remaining,
                    credits_remaining: credits,
                    plan_id: billing.plan_id,
                    byok_unlimited: false,
                })
            }
            DebitOutcome::Insufficient { remaining } => Err(Error::InsufficientTokens {
                remaining_tokens: remaining,
                remaining_credits: credits_from_tokens(remaining),
            }),
        }
    }

    pub async fn token_status(&self, account_id: &str) -> Result<TokenStatus> {
        let billing = self.db.get_or_create_billing(account_id).await?;
        let plan = plans::plan(billing.plan_id);
        let (credits_remaining, credits_total) = match billing.plan_id {
            PlanId::Byok => (-1, -1),
            _ => (
                credits_from_tokens(billing.token_quota_remaining),
                plan.display_credits.unwrap_or(0),
            ),
        };
        Ok(TokenStatus {
            account_id: account_id.to_owned(),
            plan: billing.plan_id,
            plan_name: plan.name,
            tokens_remaining: billing.token_quota_remaining,
            tokens_total: billing.token_quota_total,
            credits_remaining,
            credits_total,
            quota_resets_at: billing.quota_resets_at,
        })
    }

    /// Pre-flight check before a conversation starts. Rejects non-BYOK
    /// accounts whose balance cannot cover a minimum conversation.
    pub async fn precheck_conversation(&self, account_id: &str) -> Result<TokenStatus> {
        let status = self.token_status(account_id).await?;
        if status.plan != PlanId::Byok && status.tokens_remaining < MIN_CONVERSATION_TOKENS {
            return Err(Error::InsufficientCredits {
                credits_remaining: status.credits_remaining.max(0),
                credits_needed: credits_from_tokens(MIN_CONVERSATION_TOKENS).max(1),
            });
        }
        Ok(status)
    }

    /// Reject models the account's plan does not allow.
    pub async fn ensure_model_allowed(
        &self,
        account_id: &str,
        model: &str,
        default_model: &str,
    ) -> Result<()> {
        let plan = self.plan_for(account_id).await?;
        if let Some(allowed) = plans::allowed_models(plan, default_model) {
            if !allowed.iter().any(|m| m == model) {
                return Err(Error::Forbidden(format!(
                    "plan {} does not allow model {model}; allowed: {}",
                    plan.as_str(),
                    allowed.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Plan id with a 5-minute cache in the coordination store.
    pub async fn plan_for(&self, account_id: &str) -> Result<PlanId> {
        let cache_key = keys::user_plan(account_id);
        if let Some(cached) = self.coord.get(&cache_key).await? {
            if let Some(plan) = PlanId::parse(&cached) {
                return Ok(plan);
            }
        }
        let billing = self.db.get_or_create_billing(account_id).await?;
        self.coord
            .set(
                &cache_key,
                billing.plan_id.as_str(),
                PLAN_CACHE_TTL,
                SetMode::Always,
            )
            .await?;
        Ok(billing.plan_id)
    }

    pub async fn invalidate_plan_cache(&self, account_id: &str) {
        if let Err(e) = self.coord.delete(&keys::user_plan(account_id)).await {
            tracing::warn!(account_id, error = %e, "failed to invalidate plan cache");
        }
    }

    pub async fn reset_quota(&self, account_id: &str) -> Result<bool> {
        self.db.reset_quota(account_id).await
    }

    pub async fn change_plan(&self, account_id: &str, plan: PlanId) -> Result<TokenStatus> {
        self.db.set_plan(account_id, plan).await?;
        self.invalidate_plan_cache(account_id).await;
        self.token_status(account_id).await
    }

    pub async fn usage_history(
        &self,
        account_id: &str,
        days: i64,
    ) -> Result<Vec<TokenUsageRecord>> {
        self.db.usage_history(account_id, days).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_usage(
        &self,
        account_id: &str,
        thread_id: Option<Uuid>,
        message_id: Option<Uuid>,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        tokens_remaining_after: i64,
        estimated_cost: f64,
        is_real_cost: bool,
    ) -> Result<()> {
        self.db
            .insert_usage(TokenUsageRecord {
                id: Uuid::new_v4(),
                account_id: account_id.to_owned(),
                thread_id,
                message_id,
                model: model.to_owned(),
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                tokens_remaining_after,
                estimated_cost,
                is_real_cost,
                created_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_coordination::MemoryStore;
    use kiln_store::MemoryDatabase;

    fn ledger() -> (Ledger, Arc<MemoryDatabase>, Arc<MemoryStore>) {
        let db = Arc::new(MemoryDatabase::new());
        let coord = Arc::new(MemoryStore::new());
        let pricing = Arc::new(PricingCatalog::without_endpoint(coord.clone()));
        (
            Ledger::new(db.clone(), coord.clone(), pricing),
            db,
            coord,
        )
    }

    #[tokio::test]
    async fn consume_debits_and_logs() {
        let (ledger, db, _) = ledger();
        let receipt = ledger
            .consume_tokens("acc", 10_000, "openrouter/openai/gpt-4o", None, None)
            .await
            .unwrap();
        assert_eq!(receipt.tokens_consumed, 10_000);
        assert_eq!(receipt.tokens_remaining, 90_000);
        assert_eq!(receipt.credits_remaining, 18);
        assert!(!receipt.byok_unlimited);

        let history = db.usage_history("acc", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_tokens, 10_000);
        assert_eq!(history[0].tokens_remaining_after, 90_000);
        assert!(history[0].estimated_cost > 0.0);
    }

    #[tokio::test]
    async fn zero_tokens_is_client_error() {
        let (ledger, _, _) = ledger();
        let err = ledger
            .consume_tokens("acc", 0, "m", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClientInput(_)));
    }

    #[tokio::test]
    async fn insufficient_balance_carries_remaining() {
        let (ledger, _, _) = ledger();
        let err = ledger
            .consume_tokens("acc", 100_001, "m", None, None)
            .await
            .unwrap_err();
        match err {
            Error::InsufficientTokens {
                remaining_tokens,
                remaining_credits,
            } => {
                assert_eq!(remaining_tokens, 100_000);
                assert_eq!(remaining_credits, 20);
            }
            other => panic!("expected InsufficientTokens, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn byok_is_logged_but_never_debited() {
        let (ledger, db, _) = ledger();
        db.set_plan("acc", PlanId::Byok).await.unwrap();

        let receipt = ledger
            .consume_tokens("acc", 1_000_000, "openrouter/openai/gpt-4o", None, None)
            .await
            .unwrap();
        assert!(receipt.byok_unlimited);
        assert_eq!(receipt.credits_remaining, -1);

        // Usage was still recorded.
        let history = db.usage_history("acc", 1).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_tokens, 1_000_000);
    }

    #[tokio::test]
    async fn precheck_rejects_low_balance() {
        let (ledger, db, _) = ledger();
        db.get_or_create_billing("acc").await.unwrap();
        db.debit_tokens("acc", 97_000).await.unwrap(); // 3_000 left

        let err = ledger.precheck_conversation("acc").await.unwrap_err();
        match err {
            Error::InsufficientCredits {
                credits_remaining,
                credits_needed,
            } => {
                assert_eq!(credits_remaining, 0);
                assert!(credits_needed >= 1);
            }
            other => panic!("expected InsufficientCredits, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn precheck_passes_byok_regardless_of_balance() {
        let (ledger, db, _) = ledger();
        db.set_plan("acc", PlanId::Byok).await.unwrap();
        assert!(ledger.precheck_conversation("acc").await.is_ok());
    }

    #[tokio::test]
    async fn plan_cache_round_trip_and_invalidation() {
        let (ledger, db, coord) = ledger();
        assert_eq!(ledger.plan_for("acc").await.unwrap(), PlanId::Free);

        // Change the plan behind the cache's back: the stale cached value
        // is served until invalidation.
        db.set_plan("acc", PlanId::Pro).await.unwrap();
        assert_eq!(ledger.plan_for("acc").await.unwrap(), PlanId::Free);

        ledger.invalidate_plan_cache("acc").await;
        assert_eq!(ledger.plan_for("acc").await.unwrap(), PlanId::Pro);
        assert_eq!(
            coord.get(&keys::user_plan("acc")).await.unwrap().as_deref(),
            Some("pro")
        );
    }

    #[tokio::test]
    async fn model_gating_by_plan() {
        let (ledger, db, _) = ledger();
        let default = "openrouter/google/gemini-2.5-pro";

        // Free plan: only the default model.
        assert!(ledger.ensure_model_allowed("acc", default, default).await.is_ok());
        let err = ledger
            .ensure_model_allowed("acc", "openrouter/openai/gpt-4o", default)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        // Pro plan: anything goes.
        db.set_plan("acc", PlanId::Pro).await.unwrap();
        ledger.invalidate_plan_cache("acc").await;
        assert!(ledger
            .ensure_model_allowed("acc", "openrouter/openai/gpt-4o", default)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn change_plan_resets_and_invalidates() {
        let (ledger, _, _) = ledger();
        ledger.consume_tokens("acc", 50_000, "m", None, None).await.unwrap();
        let status = ledger.change_plan("acc", PlanId::Premium).await.unwrap();
        assert_eq!(status.plan, PlanId::Premium);
        assert_eq!(status.tokens_remaining, 1_250_000);
        assert_eq!(ledger.plan_for("acc").await.unwrap(), PlanId::Premium);
    }
}
