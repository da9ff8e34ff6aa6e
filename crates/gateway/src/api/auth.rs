//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs whose payload carries the account id in `sub`.
//! The secret is read once at startup; when none is configured the
//! server logs a warning and accepts unverified payloads (dev mode).
//! The SSE endpoint additionally accepts the token as a `?token=` query
//! parameter because EventSource cannot send headers. Admin endpoints
//! compare a SHA-256 digest of the admin key in constant time.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use kiln_domain::{Error, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::state::AppState;

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// Middleware for user-facing routes.
pub async fn require_user(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    match bearer_token(req.headers()).and_then(|token| verify_token(&state, &token)) {
        Ok(user) => {
            req.extensions_mut().insert(user);
            next.run(req).await
        }
        Err(e) => ApiError(e).into_response(),
    }
}

/// Middleware for admin routes (pool status, lock metrics).
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.admin_key_hash else {
        // Dev mode: no admin key configured.
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let provided_hash = Sha256::digest(provided.as_bytes());

    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return ApiError(Error::Auth("invalid or missing admin key".into())).into_response();
    }
    next.run(req).await
}

/// Resolve the caller from either the Authorization header or an
/// explicit query token (SSE).
pub fn user_from_parts(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<AuthUser> {
    let token = match bearer_token(headers) {
        Ok(token) => token,
        Err(_) => query_token
            .map(str::to_owned)
            .ok_or_else(|| Error::Auth("missing bearer token".into()))?,
    };
    verify_token(state, &token)
}

fn bearer_token(headers: &HeaderMap) -> Result<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned)
        .ok_or_else(|| Error::Auth("missing bearer token".into()))
}

pub fn verify_token(state: &AppState, token: &str) -> Result<AuthUser> {
    let claims = decode_jwt(token, state.config.clerk_secret_key.as_deref())?;
    if let Some(exp) = claims.exp {
        if exp < chrono::Utc::now().timestamp() {
            return Err(Error::Auth("token expired".into()));
        }
    }
    Ok(AuthUser {
        account_id: claims.sub,
    })
}

fn decode_jwt(token: &str, secret: Option<&str>) -> Result<Claims> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::Auth("malformed token".into()));
    };

    if let Some(secret) = secret {
        let header_bytes = URL_SAFE_NO_PAD
            .decode(header_b64)
            .map_err(|_| Error::Auth("malformed token header".into()))?;
        let header: Header = serde_json::from_slice(&header_bytes)
            .map_err(|_| Error::Auth("malformed token header".into()))?;
        if header.alg != "HS256" {
            return Err(Error::Auth(format!("unsupported algorithm {}", header.alg)));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| Error::Auth("malformed token signature".into()))?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| Error::Auth("invalid signing key".into()))?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        let expected = mac.finalize().into_bytes();

        if !bool::from(expected.as_slice().ct_eq(&signature)) {
            return Err(Error::Auth("invalid token signature".into()));
        }
    }

    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| Error::Auth("malformed token payload".into()))?;
    let claims: Claims =
        serde_json::from_slice(&payload).map_err(|_| Error::Auth("malformed token claims".into()))?;
    if claims.sub.is_empty() {
        return Err(Error::Auth("token missing subject".into()));
    }
    Ok(claims)
}

/// Mint an HS256 token. Test-only helper shared by the integration
/// tests; dev tooling uses the same shape.
pub fn sign_token(secret: &str, sub: &str, exp: Option<i64>) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let mut payload = serde_json::json!({ "sub": sub });
    if let Some(exp) = exp {
        payload["exp"] = serde_json::json!(exp);
    }
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{payload}.{signature}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_token_roundtrip() {
        let token = sign_token("secret", "acc-1", None);
        let claims = decode_jwt(&token, Some("secret")).unwrap();
        assert_eq!(claims.sub, "acc-1");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = sign_token("secret", "acc-1", None);
        assert!(decode_jwt(&token, Some("other")).is_err());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let token = sign_token("secret", "acc-1", None);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"acc-2"}"#);
        parts[1] = &forged;
        let forged_token = parts.join(".");
        assert!(decode_jwt(&forged_token, Some("secret")).is_err());
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(decode_jwt("only.two", Some("s")).is_err());
        assert!(decode_jwt("not-even-close", Some("s")).is_err());
        assert!(decode_jwt("a.b.c.d", Some("s")).is_err());
    }

    #[test]
    fn dev_mode_skips_signature_verification() {
        let token = sign_token("whatever", "acc-1", None);
        let claims = decode_jwt(&token, None).unwrap();
        assert_eq!(claims.sub, "acc-1");
    }

    #[test]
    fn empty_subject_is_rejected() {
        let token = sign_token("secret", "", None);
        assert!(decode_jwt(&token, Some("secret")).is_err());
    }
}
