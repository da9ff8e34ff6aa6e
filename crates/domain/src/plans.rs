//! The plan catalog and token/credit arithmetic.
//!
//! User-facing "credits" are a display unit; the ledger itself always
//! reasons in tokens. One credit is a conservative 5,000 tokens and
//! conversions floor.

use serde::{Deserialize, Serialize};

/// Closed set of billing plans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Free,
    Pro,
    Premium,
    Byok,
}

impl PlanId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Premium => "premium",
            Self::Byok => "byok",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "premium" => Some(Self::Premium),
            "byok" => Some(Self::Byok),
            _ => None,
        }
    }
}

/// Static description of one plan. `token_quota: None` means unlimited
/// (BYOK — the user supplies their own upstream API key).
#[derive(Debug, Clone, Copy)]
pub struct Plan {
    pub id: PlanId,
    pub name: &'static str,
    pub token_quota: Option<i64>,
    pub display_credits: Option<i64>,
    pub deployed_project_limit: Option<u32>,
}

const PLANS: [Plan; 4] = [
    Plan {
        id: PlanId::Free,
        name: "Free",
        token_quota: Some(100_000),
        display_credits: Some(20),
        deployed_project_limit: Some(1),
    },
    Plan {
        id: PlanId::Pro,
        name: "Pro",
        token_quota: Some(750_000),
        display_credits: Some(150),
        deployed_project_limit: Some(10),
    },
    Plan {
        id: PlanId::Premium,
        name: "Premium",
        token_quota: Some(1_250_000),
        display_credits: Some(250),
        deployed_project_limit: Some(25),
    },
    Plan {
        id: PlanId::Byok,
        name: "BYOK",
        token_quota: None,
        display_credits: None,
        deployed_project_limit: None,
    },
];

pub fn plan(id: PlanId) -> &'static Plan {
    PLANS.iter().find(|p| p.id == id).expect("plan catalog is total")
}

/// Conservative floor: a credit only counts when a full 5,000-token
/// conversation is still affordable.
pub const TOKENS_PER_CREDIT: i64 = 5_000;

/// Minimum balance required to start a conversation.
pub const MIN_CONVERSATION_TOKENS: i64 = 5_000;

pub fn credits_from_tokens(tokens: i64) -> i64 {
    if tokens <= 0 {
        0
    } else {
        tokens / TOKENS_PER_CREDIT
    }
}

pub fn tokens_from_credits(credits: i64) -> i64 {
    if credits <= 0 {
        0
    } else {
        credits * TOKENS_PER_CREDIT
    }
}

/// Per-1K-token (input, output) USD rates for the static estimate table.
/// The live pricing catalog supersedes this for BYOK real-cost logging.
fn model_rates(model: &str) -> (f64, f64) {
    match model {
        "openrouter/google/gemini-2.5-pro" => (0.0025, 0.0075),
        "openrouter/anthropic/claude-3.5-sonnet" => (0.003, 0.015),
        "openrouter/openai/gpt-4o" => (0.005, 0.015),
        _ => (0.002, 0.006),
    }
}

pub fn estimate_token_cost(prompt_tokens: i64, completion_tokens: i64, model: &str) -> f64 {
    let (input, output) = model_rates(model);
    let cost = prompt_tokens as f64 / 1000.0 * input + completion_tokens as f64 / 1000.0 * output;
    (cost * 1e6).round() / 1e6
}

/// Short aliases accepted by the API, resolved to fully qualified names.
pub fn resolve_model_alias(name: &str) -> &str {
    match name {
        "gpt-4" | "gpt-4o" => "openrouter/openai/gpt-4o",
        "claude" | "claude-3.5" | "claude-3.5-sonnet" => "openrouter/anthropic/claude-3.5-sonnet",
        "gemini" | "gemini-pro" => "openrouter/google/gemini-2.5-pro",
        other => other,
    }
}

/// Models a plan may use. Free accounts are pinned to the default model;
/// paid plans may pick any catalog model.
pub fn allowed_models(plan_id: PlanId, default_model: &str) -> Option<Vec<String>> {
    match plan_id {
        PlanId::Free => Some(vec![default_model.to_string()]),
        PlanId::Pro | PlanId::Premium | PlanId::Byok => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_values_are_contracts() {
        assert_eq!(plan(PlanId::Free).token_quota, Some(100_000));
        assert_eq!(plan(PlanId::Free).display_credits, Some(20));
        assert_eq!(plan(PlanId::Pro).token_quota, Some(750_000));
        assert_eq!(plan(PlanId::Pro).display_credits, Some(150));
        assert_eq!(plan(PlanId::Premium).token_quota, Some(1_250_000));
        assert_eq!(plan(PlanId::Premium).display_credits, Some(250));
        assert_eq!(plan(PlanId::Byok).token_quota, None);
    }

    #[test]
    fn credit_conversion_floors() {
        assert_eq!(credits_from_tokens(0), 0);
        assert_eq!(credits_from_tokens(-5), 0);
        assert_eq!(credits_from_tokens(4_999), 0);
        assert_eq!(credits_from_tokens(5_000), 1);
        assert_eq!(credits_from_tokens(9_999), 1);
        assert_eq!(credits_from_tokens(100_000), 20);
    }

    #[test]
    fn tokens_from_credits_is_exact() {
        assert_eq!(tokens_from_credits(3), 15_000);
        assert_eq!(tokens_from_credits(0), 0);
        assert_eq!(tokens_from_credits(-1), 0);
    }

    #[test]
    fn cost_estimate_uses_model_table() {
        let cost = estimate_token_cost(1000, 1000, "openrouter/openai/gpt-4o");
        assert!((cost - 0.02).abs() < 1e-9);
        let fallback = estimate_token_cost(1000, 1000, "unknown/model");
        assert!((fallback - 0.008).abs() < 1e-9);
    }

    #[test]
    fn alias_resolution() {
        assert_eq!(resolve_model_alias("claude"), "openrouter/anthropic/claude-3.5-sonnet");
        assert_eq!(resolve_model_alias("gpt-4"), "openrouter/openai/gpt-4o");
        assert_eq!(
            resolve_model_alias("openrouter/openai/gpt-4o"),
            "openrouter/openai/gpt-4o"
        );
    }

    #[test]
    fn free_plan_model_gating() {
        let allowed = allowed_models(PlanId::Free, "openrouter/google/gemini-2.5-pro");
        assert_eq!(allowed, Some(vec!["openrouter/google/gemini-2.5-pro".to_string()]));
        assert!(allowed_models(PlanId::Pro, "x").is_none());
        assert!(allowed_models(PlanId::Byok, "x").is_none());
    }

    #[test]
    fn plan_id_parse_roundtrip() {
        for id in [PlanId::Free, PlanId::Pro, PlanId::Premium, PlanId::Byok] {
            assert_eq!(PlanId::parse(id.as_str()), Some(id));
        }
        assert_eq!(PlanId::parse("enterprise"), None);
    }
}
