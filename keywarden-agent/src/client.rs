//! HTTP client for the keywarden server.
//!
//! Opens an authenticated transport and adapts server errors to agent-level
//! sentinels. Every method outside the register/login pair carries the
//! `x-username` and bearer-token metadata; a wire `PERMISSION_DENIED`
//! becomes [`AgentError::SessionExpired`] so the UI can prompt a re-login.

use crate::config::AgentConfig;
use crate::{AgentError, Result};
use async_trait::async_trait;
use keywarden_core::proto;
use reqwest::{Certificate, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::RwLock;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Authenticated HTTP client bound to one user and server.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    /// Build the transport from the agent configuration.
    ///
    /// An extra CA certificate, when configured, is added to the system
    /// root set. Plaintext is only used when TLS is explicitly disabled.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);

        if !config.cacert.is_empty() {
            let pem = std::fs::read(&config.cacert)?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        let scheme = if config.disabletls {
            tracing::warn!("TLS is disabled; connecting to the server insecurely");
            "http"
        } else {
            "https"
        };
        let base_url = format!("{scheme}://{}", config.server.trim_end_matches('/'));

        Ok(Self {
            http: builder.build()?,
            base_url,
            username: config.user.clone(),
            token: RwLock::new(None),
        })
    }

    /// Store the bearer token for subsequent authenticated calls.
    pub fn set_token(&self, token: String) {
        *self.token.write().expect("token lock") = Some(token);
    }

    /// Drop the bearer token at session end.
    pub fn clear_token(&self) {
        *self.token.write().expect("token lock") = None;
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    // --- Users ---

    pub async fn register(
        &self,
        user: proto::User,
        two_factor: bool,
    ) -> Result<proto::RegisterUserResponse> {
        self.call(
            Method::POST,
            "/api/v1/users/register",
            Some(&proto::RegisterUserRequest { user, two_factor }),
            false,
        )
        .await
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        otp_code: &str,
    ) -> Result<proto::LoginResponse> {
        self.call(
            Method::POST,
            "/api/v1/users/login",
            Some(&proto::LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
                otp_code: otp_code.to_string(),
            }),
            false,
        )
        .await
    }

    pub async fn get_user(&self) -> Result<proto::User> {
        let resp: proto::GetUserResponse = self
            .call(
                Method::GET,
                &format!("/api/v1/users/{}", self.username),
                None::<&()>,
                true,
            )
            .await?;
        Ok(resp.user)
    }

    pub async fn update_user(&self, user: proto::User) -> Result<proto::InfoResponse> {
        self.call(
            Method::PUT,
            "/api/v1/users",
            Some(&proto::UpdateUserRequest { user }),
            true,
        )
        .await
    }

    pub async fn delete_user(&self) -> Result<proto::InfoResponse> {
        self.call(
            Method::DELETE,
            &format!("/api/v1/users/{}", self.username),
            None::<&()>,
            true,
        )
        .await
    }

    pub async fn get_revision(&self) -> Result<Vec<u8>> {
        let resp: proto::RevisionResponse = self
            .call(
                Method::GET,
                &format!("/api/v1/users/{}/revision", self.username),
                None::<&()>,
                true,
            )
            .await?;
        Ok(resp.revision)
    }

    // --- Items ---

    pub async fn create_item(&self, item: proto::Item) -> Result<proto::InfoResponse> {
        self.call(
            Method::POST,
            "/api/v1/items/create",
            Some(&proto::CreateItemRequest {
                username: self.username.clone(),
                item,
            }),
            true,
        )
        .await
    }

    pub async fn get_item(&self, name: &str, item_type: &str) -> Result<proto::Item> {
        self.call(
            Method::POST,
            "/api/v1/items/get",
            Some(&proto::GetItemRequest {
                username: self.username.clone(),
                name: name.to_string(),
                item_type: item_type.to_string(),
            }),
            true,
        )
        .await
    }

    pub async fn get_item_list(&self) -> Result<Vec<proto::ItemSummary>> {
        self.call(
            Method::POST,
            "/api/v1/items/list",
            Some(&proto::ItemListRequest {
                username: self.username.clone(),
            }),
            true,
        )
        .await
    }

    pub async fn get_items(&self, ids: &[i64]) -> Result<Vec<proto::Item>> {
        self.call(
            Method::POST,
            "/api/v1/items/batch",
            Some(&proto::GetItemsRequest {
                username: self.username.clone(),
                ids: ids.to_vec(),
            }),
            true,
        )
        .await
    }

    pub async fn get_item_hash(&self, id: i64) -> Result<Vec<u8>> {
        let resp: proto::ItemHashResponse = self
            .call(
                Method::POST,
                "/api/v1/items/hash",
                Some(&proto::ItemHashRequest { id }),
                true,
            )
            .await?;
        Ok(resp.hash)
    }

    pub async fn update_item(&self, item: proto::Item) -> Result<proto::InfoResponse> {
        self.call(
            Method::POST,
            "/api/v1/items/update",
            Some(&proto::UpdateItemRequest {
                username: self.username.clone(),
                item,
            }),
            true,
        )
        .await
    }

    pub async fn delete_item(&self, id: i64) -> Result<proto::InfoResponse> {
        self.call(
            Method::POST,
            "/api/v1/items/delete",
            Some(&proto::DeleteItemRequest {
                username: self.username.clone(),
                id,
            }),
            true,
        )
        .await
    }

    // --- Internal helpers ---

    async fn call<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        authed: bool,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.request(method, &url);

        if authed {
            let token = self
                .token
                .read()
                .expect("token lock")
                .clone()
                .ok_or(AgentError::NotLoggedIn)?;
            request = request
                .header(proto::USERNAME_HEADER, &self.username)
                .header("authorization", format!("Bearer {token}"));
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            return Err(adapt_error(status, &bytes, authed));
        }

        serde_json::from_slice(&bytes).map_err(|_| AgentError::MissedServerResponse)
    }
}

/// Map a failed response to the agent error taxonomy.
///
/// A `PERMISSION_DENIED` on an authenticated call means the token was
/// rejected; on login/register it is an ordinary credential failure and
/// passes through with its code.
fn adapt_error(status: StatusCode, body: &[u8], authed: bool) -> AgentError {
    let parsed: Option<proto::ErrorBody> = serde_json::from_slice(body).ok();

    match parsed {
        Some(body) if authed && body.code == proto::code::PERMISSION_DENIED => {
            AgentError::SessionExpired
        }
        Some(body) => AgentError::Server {
            code: body.code,
            message: body.error,
        },
        None => AgentError::Server {
            code: status.as_u16().to_string(),
            message: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

/// Remote operations the sync engine depends on.
#[async_trait]
pub trait RemoteVault: Send + Sync {
    /// Current server revision for the session user.
    async fn get_revision(&self) -> Result<Vec<u8>>;
    /// Short item list for the session user.
    async fn get_item_list(&self) -> Result<Vec<proto::ItemSummary>>;
    /// Batch fetch of full items, order preserved.
    async fn get_items(&self, ids: &[i64]) -> Result<Vec<proto::Item>>;
}

#[async_trait]
impl RemoteVault for ApiClient {
    async fn get_revision(&self) -> Result<Vec<u8>> {
        ApiClient::get_revision(self).await
    }

    async fn get_item_list(&self) -> Result<Vec<proto::ItemSummary>> {
        ApiClient::get_item_list(self).await
    }

    async fn get_items(&self, ids: &[i64]) -> Result<Vec<proto::Item>> {
        ApiClient::get_items(self, ids).await
    }
}
