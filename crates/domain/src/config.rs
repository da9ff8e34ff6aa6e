//! Process configuration, read from the environment.
//!
//! Precedence is plain: the process environment is the single source;
//! deployment tooling (or a local `.env` loaded before startup) is
//! responsible for populating it.

use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Sandbox pool tuning. Defaults match the production values.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSettings {
    /// Warm instances kept per app type.
    pub min_warm_sandboxes: usize,
    pub max_total_sandboxes: usize,
    pub max_idle_time: Duration,
    pub max_session_time: Duration,
    pub cleanup_interval: Duration,
    /// Scale the warm pool up once utilization crosses this fraction.
    pub scale_threshold: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_warm_sandboxes: 2,
            max_total_sandboxes: 50,
            max_idle_time: Duration::from_secs(30 * 60),
            max_session_time: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            scale_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub bind_addr: String,
    /// Coordination store connection string. Required for multi-instance
    /// deployments; absence selects the in-process backend.
    pub redis_url: Option<String>,
    /// Durable store endpoint + service credential.
    pub database_url: Option<String>,
    pub database_service_key: Option<String>,
    /// System LLM key used for non-BYOK accounts.
    pub openrouter_api_key: Option<String>,
    /// HS256 secret for verifying bearer tokens. Absent = dev mode.
    pub clerk_secret_key: Option<String>,
    pub admin_api_key: Option<String>,
    /// Sandbox provider credentials; absent selects the stub provider.
    pub sandbox_api_key: Option<String>,
    pub sandbox_server_url: Option<String>,
    pub sandbox_snapshot_name: String,
    pub mobile_sandbox_snapshot_name: String,
    /// Default model when a request names none.
    pub default_model: String,
    /// Master secret for at-rest encryption of stored BYOK keys.
    pub master_key: Option<String>,
    pub pool: PoolSettings,
    /// Embedded executor tasks per `serve` process.
    pub workers: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("KILN_BIND_ADDR", "0.0.0.0:8000"),
            redis_url: env_opt("REDIS_URL"),
            database_url: env_opt("SUPABASE_URL"),
            database_service_key: env_opt("SUPABASE_SERVICE_ROLE_KEY"),
            openrouter_api_key: env_opt("OPENROUTER_API_KEY"),
            clerk_secret_key: env_opt("CLERK_SECRET_KEY"),
            admin_api_key: env_opt("ADMIN_API_KEY"),
            sandbox_api_key: env_opt("DAYTONA_API_KEY"),
            sandbox_server_url: env_opt("DAYTONA_SERVER_URL"),
            sandbox_snapshot_name: env_or("SANDBOX_SNAPSHOT_NAME", "kiln-web"),
            mobile_sandbox_snapshot_name: env_or("MOBILE_SANDBOX_SNAPSHOT_NAME", "kiln-mobile"),
            default_model: env_or("MODEL_TO_USE", "openrouter/google/gemini-2.5-pro"),
            master_key: env_opt("KILN_MASTER_KEY"),
            pool: PoolSettings::default(),
            workers: env_opt("KILN_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }

    /// Sanity-check the configuration. Errors abort startup; warnings are
    /// logged and the server degrades (stub sandbox provider, dev auth,
    /// in-process coordination).
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let warn = |issues: &mut Vec<ConfigIssue>, msg: &str| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: msg.to_string(),
            })
        };

        if self.redis_url.is_none() {
            warn(
                &mut issues,
                "REDIS_URL not set; using the in-process coordination store; \
                 multi-instance deployments require an external store",
            );
        }
        if self.clerk_secret_key.is_none() {
            warn(
                &mut issues,
                "CLERK_SECRET_KEY not set; bearer tokens are accepted without \
                 signature verification (dev mode)",
            );
        }
        if self.sandbox_api_key.is_none() || self.sandbox_server_url.is_none() {
            warn(
                &mut issues,
                "sandbox provider not configured (DAYTONA_API_KEY / DAYTONA_SERVER_URL); \
                 using the stub provider",
            );
        }
        if self.openrouter_api_key.is_none() {
            warn(
                &mut issues,
                "OPENROUTER_API_KEY not set; only BYOK accounts can run agents",
            );
        }
        if self.master_key.is_none() {
            warn(
                &mut issues,
                "KILN_MASTER_KEY not set; stored BYOK keys cannot be decrypted",
            );
        }
        if self.workers == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "KILN_WORKERS must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.pool.scale_threshold) {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "pool scale_threshold must be within [0, 1]".to_string(),
            });
        }
        issues
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".into(),
            redis_url: Some("redis://localhost".into()),
            database_url: None,
            database_service_key: None,
            openrouter_api_key: Some("sk-or-test".into()),
            clerk_secret_key: Some("secret".into()),
            admin_api_key: None,
            sandbox_api_key: Some("key".into()),
            sandbox_server_url: Some("https://sandboxes".into()),
            sandbox_snapshot_name: "kiln-web".into(),
            mobile_sandbox_snapshot_name: "kiln-mobile".into(),
            default_model: "openrouter/google/gemini-2.5-pro".into(),
            master_key: Some("m".into()),
            pool: PoolSettings::default(),
            workers: 2,
        }
    }

    #[test]
    fn complete_config_has_no_issues() {
        assert!(base_config().validate().is_empty());
    }

    #[test]
    fn missing_redis_is_a_warning() {
        let mut cfg = base_config();
        cfg.redis_url = None;
        let issues = cfg.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    }

    #[test]
    fn zero_workers_is_an_error() {
        let mut cfg = base_config();
        cfg.workers = 0;
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn pool_defaults_match_contract() {
        let pool = PoolSettings::default();
        assert_eq!(pool.min_warm_sandboxes, 2);
        assert_eq!(pool.max_total_sandboxes, 50);
        assert_eq!(pool.max_idle_time, Duration::from_secs(1800));
        assert_eq!(pool.cleanup_interval, Duration::from_secs(300));
    }
}
