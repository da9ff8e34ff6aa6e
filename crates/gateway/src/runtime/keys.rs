//! Upstream API-key resolution.
//!
//! BYOK accounts bring their own key (stored AES-encrypted at rest);
//! everyone else uses the system key. When the LLM provider rejects a
//! user's key, it is deactivated conditionally on its id and the plan
//! cache is cleared so the account immediately falls back to metered
//! plans.

use std::sync::Arc;

use chrono::Utc;
use kiln_billing::Ledger;
use kiln_domain::entities::UserLlmKey;
use kiln_domain::{Error, Result};
use kiln_store::{Database, KeyVault};
use uuid::Uuid;

pub const LLM_PROVIDER: &str = "openrouter";

#[derive(Debug, Clone)]
pub enum KeySource {
    UserByok { key_id: Uuid },
    System,
}

#[derive(Clone)]
pub struct ResolvedApiKey {
    pub secret: String,
    pub source: KeySource,
}

pub struct KeyResolver {
    db: Arc<dyn Database>,
    vault: Option<Arc<KeyVault>>,
    ledger: Arc<Ledger>,
    system_key: Option<String>,
}

impl KeyResolver {
    pub fn new(
        db: Arc<dyn Database>,
        vault: Option<Arc<KeyVault>>,
        ledger: Arc<Ledger>,
        system_key: Option<String>,
    ) -> Self {
        Self {
            db,
            vault,
            ledger,
            system_key,
        }
    }

    /// User key first, system key second. `None` when neither exists.
    pub async fn resolve(&self, account_id: &str) -> Result<Option<ResolvedApiKey>> {
        if let Some(stored) = self.db.active_user_key(account_id, LLM_PROVIDER).await? {
            match &self.vault {
                Some(vault) => match vault.decrypt(&stored.encrypted_key) {
                    Ok(secret) => {
                        return Ok(Some(ResolvedApiKey {
                            secret,
                            source: KeySource::UserByok {
                                key_id: stored.key_id,
                            },
                        }))
                    }
                    Err(e) => {
                        tracing::error!(
                            account_id,
                            key_id = %stored.key_id,
                            error = %e,
                            "stored user key is undecryptable, falling back to system key"
                        );
                    }
                },
                None => {
                    tracing::warn!(
                        account_id,
                        "user key present but no master key configured, falling back"
                    );
                }
            }
        }

        Ok(self.system_key.as_ref().map(|secret| ResolvedApiKey {
            secret: secret.clone(),
            source: KeySource::System,
        }))
    }

    /// Encrypt and store a user's key, replacing any previous one.
    pub async fn store_user_key(&self, account_id: &str, plaintext: &str) -> Result<Uuid> {
        let vault = self.vault.as_ref().ok_or_else(|| {
            Error::Config("cannot store user keys without a master key configured".into())
        })?;
        let key = UserLlmKey {
            key_id: Uuid::new_v4(),
            account_id: account_id.to_owned(),
            provider: LLM_PROVIDER.to_owned(),
            encrypted_key: vault.encrypt(plaintext)?,
            active: true,
            created_at: Utc::now(),
        };
        let key_id = key.key_id;
        self.db.upsert_user_key(key).await?;
        Ok(key_id)
    }

    /// The upstream provider returned 401 for this key. Deactivate the
    /// stored key (conditional on its id) and clear the cached plan so
    /// quota enforcement resumes immediately.
    pub async fn handle_auth_failure(&self, account_id: &str, source: &KeySource) {
        let KeySource::UserByok { key_id } = source else {
            tracing::error!(account_id, "system LLM key was rejected upstream");
            return;
        };
        match self.db.deactivate_user_key(account_id, *key_id).await {
            Ok(true) => {
                tracing::warn!(account_id, %key_id, "deactivated rejected user LLM key");
                self.ledger.invalidate_plan_cache(account_id).await;
            }
            Ok(false) => {
                tracing::debug!(account_id, %key_id, "rejected key was already replaced");
            }
            Err(e) => {
                tracing::error!(account_id, %key_id, error = %e, "failed to deactivate user key");
            }
        }
    }
}
