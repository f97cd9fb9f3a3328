//! Token authority and request authorization middleware.
//!
//! Tokens are symmetric AEAD envelopes: a JSON payload
//! `{username, issued_at, expires_at, nonce}` sealed under the process-wide
//! 32-byte server key and base64url-encoded. Every route outside the
//! register/login pair requires the `x-username` and `authorization` headers;
//! handlers additionally check that any username inside the request body
//! matches the asserted one.

use crate::error::ApiError;
use crate::AppState;
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use keywarden_core::crypto::{seal, unseal};
use keywarden_core::proto::USERNAME_HEADER;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Identity asserted by a verified request, inserted into extensions.
#[derive(Debug, Clone)]
pub struct AuthedUser(pub String);

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid token")]
    Invalid,

    #[error("expired token")]
    Expired,

    #[error("token does not match asserted username")]
    Mismatch,
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    username: String,
    issued_at: i64,
    expires_at: i64,
    nonce: Uuid,
}

/// Issues and verifies bearer tokens under a process-wide key.
pub struct TokenAuthority {
    key: [u8; 32],
    ttl: Duration,
}

impl TokenAuthority {
    pub fn new(key: [u8; 32], ttl: Duration) -> Self {
        Self { key, ttl }
    }

    /// Issue a token asserting the given username.
    pub fn issue(&self, username: &str) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let payload = TokenPayload {
            username: username.to_string(),
            issued_at: now,
            expires_at: now + self.ttl.as_secs() as i64,
            nonce: Uuid::new_v4(),
        };

        let bytes = serde_json::to_vec(&payload).map_err(|_| AuthError::Invalid)?;
        let sealed = seal(&self.key, &bytes).map_err(|_| AuthError::Invalid)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Verify a token against the asserted username.
    pub fn verify(&self, token: &str, username: &str) -> Result<(), AuthError> {
        let sealed = URL_SAFE_NO_PAD.decode(token).map_err(|_| AuthError::Invalid)?;
        let bytes = unseal(&self.key, &sealed).map_err(|_| AuthError::Invalid)?;
        let payload: TokenPayload =
            serde_json::from_slice(&bytes).map_err(|_| AuthError::Invalid)?;

        if Utc::now().timestamp() > payload.expires_at {
            return Err(AuthError::Expired);
        }
        if payload.username != username {
            return Err(AuthError::Mismatch);
        }
        Ok(())
    }
}

/// Middleware guarding every authenticated route.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let username = request
        .headers()
        .get(USERNAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| ApiError::PermissionDenied("cannot retrieve user name".to_string()))?;

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .ok_or_else(|| ApiError::PermissionDenied("cannot retrieve token".to_string()))?;

    state
        .tokens
        .verify(&token, &username)
        .map_err(|e| ApiError::PermissionDenied(e.to_string()))?;

    request.extensions_mut().insert(AuthedUser(username));
    Ok(next.run(request).await)
}

/// Reject a request whose body names a different user than the caller.
pub fn ensure_self(authed: &AuthedUser, body_username: &str) -> Result<(), ApiError> {
    if authed.0 != body_username {
        return Err(ApiError::PermissionDenied("access denied".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(ttl_secs: u64) -> TokenAuthority {
        TokenAuthority::new(*b"0123456789abcdef0123456789abcdef", Duration::from_secs(ttl_secs))
    }

    #[test]
    fn issue_and_verify() {
        let auth = authority(60);
        let token = auth.issue("alice").unwrap();
        assert!(auth.verify(&token, "alice").is_ok());
    }

    #[test]
    fn username_mismatch_rejected() {
        let auth = authority(60);
        let token = auth.issue("alice").unwrap();
        assert!(matches!(auth.verify(&token, "mallory"), Err(AuthError::Mismatch)));
    }

    #[test]
    fn expired_token_rejected() {
        let auth = authority(0);
        let token = auth.issue("alice").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(matches!(auth.verify(&token, "alice"), Err(AuthError::Expired)));
    }

    #[test]
    fn garbage_token_rejected() {
        let auth = authority(60);
        assert!(matches!(auth.verify("not-a-token", "alice"), Err(AuthError::Invalid)));
    }

    #[test]
    fn token_from_other_key_rejected() {
        let a = authority(60);
        let b = TokenAuthority::new(*b"ffffffffffffffffffffffffffffffff", Duration::from_secs(60));
        let token = a.issue("alice").unwrap();
        assert!(matches!(b.verify(&token, "alice"), Err(AuthError::Invalid)));
    }

    #[test]
    fn ensure_self_guards_cross_user_access() {
        let authed = AuthedUser("alice".to_string());
        assert!(ensure_self(&authed, "alice").is_ok());
        assert!(ensure_self(&authed, "bob").is_err());
    }

    #[test]
    fn tokens_are_unique_per_issue() {
        let auth = authority(60);
        assert_ne!(auth.issue("alice").unwrap(), auth.issue("alice").unwrap());
    }
}
