/// Shared error type used across all Kiln crates.
///
/// Variants follow the failure taxonomy of the public API: client input,
/// auth, quota, upstream, resource exhaustion, internal. Each maps to a
/// stable HTTP status via [`Error::status_code`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    ClientInput(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Pre-flight quota rejection: the account cannot start a conversation.
    #[error("insufficient credits: {credits_remaining} remaining, {credits_needed} needed")]
    InsufficientCredits {
        credits_remaining: i64,
        credits_needed: i64,
    },

    /// Atomic debit rejection: the requested amount exceeds the balance.
    /// No state change occurred.
    #[error("insufficient tokens: {remaining_tokens} tokens ({remaining_credits} credits) remaining")]
    InsufficientTokens {
        remaining_tokens: i64,
        remaining_credits: i64,
    },

    #[error("upstream transient: {0}")]
    UpstreamTransient(String),

    /// The LLM provider rejected the credentials used for the call.
    #[error("upstream auth: {0}")]
    UpstreamAuth(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("config: {0}")]
    Config(String),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status for the API edge.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::ClientInput(_) => 400,
            Error::Auth(_) => 401,
            Error::InsufficientCredits { .. } | Error::InsufficientTokens { .. } => 402,
            Error::Forbidden(_) | Error::UpstreamAuth(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::UpstreamTransient(_) => 503,
            Error::ResourceExhausted(_)
            | Error::Config(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ClientInput(_) => "invalid_input",
            Error::Auth(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::InsufficientCredits { .. } => "insufficient_credits",
            Error::InsufficientTokens { .. } => "insufficient_tokens",
            Error::UpstreamTransient(_) => "upstream_unavailable",
            Error::UpstreamAuth(_) => "upstream_auth",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Conflict(_) => "conflict",
            Error::Config(_) => "config",
            Error::Json(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) => "internal",
        }
    }
}
