//! Durable entities: projects, threads, messages, billing, stored keys.
//!
//! Ownership is strictly hierarchical: a Project owns its sandbox record
//! (1:1) and its Threads (1:N); a Thread owns its Messages and AgentRuns.
//! Billing customers are singletons keyed by account id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plans::PlanId;

/// Kind of application a project builds. Immutable for the lifetime of a
/// sandbox; warm pools are partitioned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    Web,
    Mobile,
}

impl AppType {
    /// Lenient parse matching the API contract: anything unrecognized
    /// falls back to `web` with a warning.
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "web" => Self::Web,
            "mobile" => Self::Mobile,
            other => {
                tracing::warn!(app_type = other, "invalid app_type, defaulting to web");
                Self::Web
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Mobile => "mobile",
        }
    }
}

/// Embedded record describing the sandbox a project owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: Uuid,
    pub account_id: String,
    pub name: String,
    pub app_type: AppType,
    /// Exactly one sandbox for the project's lifetime, attached shortly
    /// after creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxDescriptor>,
    #[serde(default)]
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(account_id: impl Into<String>, name: impl Into<String>, app_type: AppType) -> Self {
        Self {
            project_id: Uuid::new_v4(),
            account_id: account_id.into(),
            name: name.into(),
            app_type,
            sandbox: None,
            is_public: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default)]
    pub is_agent_builder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: Uuid,
    pub project_id: Uuid,
    pub account_id: String,
    #[serde(default)]
    pub metadata: ThreadMetadata,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(project_id: Uuid, account_id: impl Into<String>) -> Self {
        Self {
            thread_id: Uuid::new_v4(),
            project_id,
            account_id: account_id.into(),
            metadata: ThreadMetadata::default(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    Tool,
    Status,
}

/// One entry in a thread's conversation. Messages form a total order by
/// `(created_at, message_id)`; the order presented to the LLM must match
/// it exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    pub kind: MessageKind,
    /// Structured payload, opaque to the orchestration core.
    pub content: serde_json::Value,
    pub is_llm_message: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(thread_id: Uuid, kind: MessageKind, content: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            thread_id,
            kind,
            content,
            is_llm_message: matches!(kind, MessageKind::User | MessageKind::Assistant),
            agent_id: None,
            agent_version_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Billing singleton per account.
///
/// Invariant: `0 <= token_quota_remaining <= token_quota_total`, enforced
/// by the atomic debit path in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingCustomer {
    pub account_id: String,
    pub plan_id: PlanId,
    pub token_quota_total: i64,
    pub token_quota_remaining: i64,
    pub quota_resets_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Append-only usage record; never updated after insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: Uuid,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub tokens_remaining_after: i64,
    pub estimated_cost: f64,
    /// True when the cost came from the live pricing catalog rather than
    /// the static estimate table (BYOK accounts).
    #[serde(default)]
    pub is_real_cost: bool,
    pub created_at: DateTime<Utc>,
}

/// AES-GCM ciphertext plus its nonce, both base64; the plaintext never
/// leaves the application process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub nonce: String,
    pub ciphertext: String,
}

/// A user-supplied upstream LLM API key (BYOK plans).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLlmKey {
    pub key_id: Uuid,
    pub account_id: String,
    pub provider: String,
    pub encrypted_key: EncryptedSecret,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_type_lenient_parse() {
        assert_eq!(AppType::parse_lenient("web"), AppType::Web);
        assert_eq!(AppType::parse_lenient("mobile"), AppType::Mobile);
        assert_eq!(AppType::parse_lenient("desktop"), AppType::Web);
    }

    #[test]
    fn message_llm_flag_follows_kind() {
        let t = Uuid::new_v4();
        assert!(Message::new(t, MessageKind::User, serde_json::json!("hi")).is_llm_message);
        assert!(Message::new(t, MessageKind::Assistant, serde_json::json!("ok")).is_llm_message);
        assert!(!Message::new(t, MessageKind::Status, serde_json::json!({})).is_llm_message);
    }

    #[test]
    fn project_serde_roundtrip() {
        let mut p = Project::new("acc-1", "My App", AppType::Mobile);
        p.sandbox = Some(SandboxDescriptor {
            id: "sb-1".into(),
            preview_url: Some("https://preview".into()),
        });
        let json = serde_json::to_string(&p).unwrap();
        let back: Project = serde_json::from_str(&json).unwrap();
        assert_eq!(back.project_id, p.project_id);
        assert_eq!(back.app_type, AppType::Mobile);
        assert_eq!(back.sandbox.unwrap().id, "sb-1");
    }
}
