//! Domain-error → HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use kiln_domain::Error;

pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self(Error::from(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = match &self.0 {
            Error::InsufficientCredits {
                credits_remaining,
                credits_needed,
            } => serde_json::json!({
                "error": self.0.code(),
                "message": format!(
                    "Insufficient credits to start conversation. You have {credits_remaining} \
                     credits remaining, but need at least {credits_needed} credits."
                ),
                "credits_remaining": credits_remaining,
                "credits_needed": credits_needed,
                "upgrade_required": true,
            }),
            Error::InsufficientTokens {
                remaining_tokens,
                remaining_credits,
            } => serde_json::json!({
                "error": self.0.code(),
                "message": self.0.to_string(),
                "tokens_remaining": remaining_tokens,
                "credits_remaining": remaining_credits,
                "upgrade_required": true,
            }),
            other => serde_json::json!({
                "error": other.code(),
                "message": other.to_string(),
            }),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.0, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_domain::plans::credits_from_tokens;

    #[test]
    fn quota_error_body_shape() {
        let err = ApiError(Error::InsufficientCredits {
            credits_remaining: 0,
            credits_needed: 1,
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn credits_conversion_used_by_402_path() {
        // 3_000 tokens display as zero whole credits.
        assert_eq!(credits_from_tokens(3_000), 0);
    }
}
