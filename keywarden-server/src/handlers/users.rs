//! Users service: registration, login, account management.

use crate::auth::{ensure_self, AuthedUser};
use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Path, State};
use axum::{Extension, Json};
use keywarden_core::crypto::verify_password;
use keywarden_core::{proto, totp};

/// Issuer label embedded in TOTP provisioning URLs.
const TOTP_ISSUER: &str = "keywarden";

/// Register a new user. Exempt from authentication.
///
/// When two-factor enrolment is requested, the TOTP secret is generated
/// here and stored inside the user row before it is persisted.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<proto::RegisterUserRequest>,
) -> Result<Json<proto::RegisterUserResponse>, ApiError> {
    let mut user = req.user;

    let enrolment = if req.two_factor {
        let enrolment = totp::generate_enrolment(&user.username, TOTP_ISSUER)
            .map_err(|_| ApiError::Internal("failed to create OTP".to_string()))?;
        user.otpkey = Some(enrolment.secret.clone());
        Some(enrolment)
    } else {
        None
    };

    state.storage.create_user(&user).map_err(|e| {
        tracing::warn!(username = %user.username, error = %e, "create user failed");
        ApiError::from(e)
    })?;

    Ok(Json(proto::RegisterUserResponse {
        info: format!("successfully created user '{}'", user.username),
        totp_key: enrolment.map(|e| proto::TotpKey {
            secret: e.secret,
            qr_png: e.qr_png,
        }),
    }))
}

/// Authenticate a user and issue a session token. Exempt from authentication.
///
/// With 2FA enabled and no code supplied, responds `{second_factor: true}`
/// and no token; the client is expected to retry with a code.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<proto::LoginRequest>,
) -> Result<Json<proto::LoginResponse>, ApiError> {
    let (pwdhash, otpkey) = state.storage.get_user_auth(&req.username).map_err(|e| {
        tracing::warn!(username = %req.username, error = %e, "login lookup failed");
        ApiError::from(e)
    })?;

    if !verify_password(&req.password, &pwdhash) {
        return Err(ApiError::PermissionDenied("wrong password".to_string()));
    }

    if !otpkey.is_empty() {
        if req.otp_code.is_empty() {
            return Ok(Json(proto::LoginResponse {
                second_factor: true,
                ..proto::LoginResponse::default()
            }));
        }
        if !totp::verify_code(&req.otp_code, &otpkey) {
            return Err(ApiError::PermissionDenied(
                "wrong verification code".to_string(),
            ));
        }
    }

    let token = state
        .tokens
        .issue(&req.username)
        .map_err(|_| ApiError::Internal("failed to generate token".to_string()))?;

    let ekey = state
        .storage
        .get_user_dek(&req.username)
        .map_err(|_| ApiError::Internal("failed to fetch encryption key".to_string()))?;

    Ok(Json(proto::LoginResponse {
        second_factor: false,
        token: Some(token),
        ekey: Some(ekey),
        server_limits: Some(proto::ServerLimits {
            max_secret_size: state.storage.max_secret_size(),
        }),
    }))
}

/// Return the full user record.
pub async fn get_user(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Path(username): Path<String>,
) -> Result<Json<proto::GetUserResponse>, ApiError> {
    ensure_self(&authed, &username)?;
    let user = state.storage.get_user_by_name(&username)?;
    Ok(Json(proto::GetUserResponse { user }))
}

/// Return the user's current revision token.
pub async fn get_revision(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Path(username): Path<String>,
) -> Result<Json<proto::RevisionResponse>, ApiError> {
    ensure_self(&authed, &username)?;
    let revision = state.storage.get_user_revision(&username)?;
    Ok(Json(proto::RevisionResponse { revision }))
}

/// Update user fields; absent fields keep their stored values.
pub async fn update_user(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Json(req): Json<proto::UpdateUserRequest>,
) -> Result<Json<proto::InfoResponse>, ApiError> {
    ensure_self(&authed, &req.user.username)?;
    state.storage.update_user(&req.user)?;
    Ok(Json(proto::InfoResponse {
        info: format!("successfully updated user '{}'", req.user.username),
    }))
}

/// Delete a user and all owned items.
pub async fn delete_user(
    State(state): State<AppState>,
    Extension(authed): Extension<AuthedUser>,
    Path(username): Path<String>,
) -> Result<Json<proto::InfoResponse>, ApiError> {
    ensure_self(&authed, &username)?;
    state.storage.delete_user(&username)?;
    tracing::info!(username = %username, "user deleted");
    Ok(Json(proto::InfoResponse {
        info: format!("successfully deleted user '{}'", username),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use keywarden_core::crypto::hash_password;

    fn register_request(username: &str, password: &str, two_factor: bool) -> proto::RegisterUserRequest {
        proto::RegisterUserRequest {
            user: proto::User {
                username: username.to_string(),
                pwdhash: Some(hash_password(password).unwrap()),
                ekey: Some(vec![7u8; 76]),
                ..proto::User::default()
            },
            two_factor,
        }
    }

    #[tokio::test]
    async fn register_then_login() {
        let state = test_state();

        let resp = register(
            State(state.clone()),
            Json(register_request("alice", "hunter2", false)),
        )
        .await
        .unwrap();
        assert!(resp.0.info.contains("alice"));
        assert!(resp.0.totp_key.is_none());

        let resp = login(
            State(state),
            Json(proto::LoginRequest {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                otp_code: String::new(),
            }),
        )
        .await
        .unwrap();

        assert!(!resp.0.second_factor);
        assert!(resp.0.token.is_some());
        assert_eq!(resp.0.ekey.as_deref(), Some(&[7u8; 76][..]));
        assert_eq!(resp.0.server_limits.unwrap().max_secret_size, 1024);
    }

    #[tokio::test]
    async fn wrong_password_is_permission_denied() {
        let state = test_state();
        register(
            State(state.clone()),
            Json(register_request("alice", "hunter2", false)),
        )
        .await
        .unwrap();

        let err = login(
            State(state),
            Json(proto::LoginRequest {
                username: "alice".to_string(),
                password: "wrong".to_string(),
                otp_code: String::new(),
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let state = test_state();
        let err = login(
            State(state),
            Json(proto::LoginRequest {
                username: "ghost".to_string(),
                password: "whatever".to_string(),
                otp_code: String::new(),
            }),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn two_factor_flow() {
        let state = test_state();

        let resp = register(
            State(state.clone()),
            Json(register_request("alice", "hunter2", true)),
        )
        .await
        .unwrap();
        let totp_key = resp.0.totp_key.expect("enrolment material");
        assert!(!totp_key.secret.is_empty());
        assert_eq!(&totp_key.qr_png[..4], b"\x89PNG");

        // No code: second factor requested, no token issued.
        let resp = login(
            State(state.clone()),
            Json(proto::LoginRequest {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                otp_code: String::new(),
            }),
        )
        .await
        .unwrap();
        assert!(resp.0.second_factor);
        assert!(resp.0.token.is_none());

        // Valid code: token issued.
        let code = keywarden_core::totp::generate_current_code(&totp_key.secret).unwrap();
        let resp = login(
            State(state.clone()),
            Json(proto::LoginRequest {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                otp_code: code,
            }),
        )
        .await
        .unwrap();
        assert!(resp.0.token.is_some());

        // Wrong code: denied. Avoid the live code to keep this deterministic.
        let live = keywarden_core::totp::generate_current_code(&totp_key.secret).unwrap();
        let wrong = if live == "000001" { "000002" } else { "000001" };
        let err = login(
            State(state),
            Json(proto::LoginRequest {
                username: "alice".to_string(),
                password: "hunter2".to_string(),
                otp_code: wrong.to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn cross_user_access_is_denied() {
        let state = test_state();
        register(
            State(state.clone()),
            Json(register_request("alice", "pw", false)),
        )
        .await
        .unwrap();

        let err = get_user(
            State(state),
            Extension(AuthedUser("mallory".to_string())),
            Path("alice".to_string()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::PermissionDenied(_)));
    }
}
