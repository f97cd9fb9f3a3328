//! Agent session: registration, login, the field-level crypto envelope
//! and the write-path coordination with the sync engine.
//!
//! The unwrapped DEK is scoped to the session value and zeroized when the
//! session ends. In local mode every successful write forces a sync and
//! waits for it, so the next list refresh already sees the mutation.

use crate::cache::Cache;
use crate::client::ApiClient;
use crate::config::{AgentMode, SharedConfig};
use crate::sync::{SyncEngine, SyncHandle};
use crate::{AgentError, Result};
use keywarden_core::crypto::{
    hash_password, seal, seal_with_passphrase, unseal, unseal_with_passphrase, DataEncryptionKey,
};
use keywarden_core::{model, proto};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroize;

/// How long logout waits for the cache close signal before proceeding.
pub const WAIT_FOR_CLOSING_INTERVAL: Duration = Duration::from_secs(5);

/// Registration form data.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub password: String,
    pub password_confirm: String,
    pub secret_key: String,
    pub email: String,
    pub two_factor: bool,
}

/// Validate the registration form before any crypto work.
pub fn validate_new_user(user: &NewUser) -> Result<()> {
    if user.password.is_empty() {
        return Err(AgentError::InvalidInput(
            "password must not be empty".to_string(),
        ));
    }
    if user.password != user.password_confirm {
        return Err(AgentError::InvalidInput(
            "password confirmation does not match".to_string(),
        ));
    }
    if user.secret_key.is_empty() {
        return Err(AgentError::InvalidInput(
            "secret key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Register a new user account.
///
/// The agent hashes the password, generates a fresh DEK, wraps it under the
/// secret key and discards the cleartext DEK; the server only ever receives
/// the hash and the wrapped key.
pub async fn register(client: &ApiClient, user: &NewUser) -> Result<Option<proto::TotpKey>> {
    validate_new_user(user)?;

    let pwdhash = hash_password(&user.password)?;

    let dek = DataEncryptionKey::generate();
    let wrapped_dek = seal_with_passphrase(user.secret_key.as_bytes(), dek.as_bytes())
        .map_err(|_| AgentError::DekEncryptionFailed)?;
    drop(dek);

    let response = client
        .register(
            proto::User {
                username: user.username.clone(),
                email: if user.email.is_empty() {
                    None
                } else {
                    Some(user.email.clone())
                },
                pwdhash: Some(pwdhash),
                ekey: Some(wrapped_dek),
                ..proto::User::default()
            },
            user.two_factor,
        )
        .await?;

    if user.two_factor {
        return response
            .totp_key
            .map(Some)
            .ok_or(AgentError::MissedServerResponse);
    }
    Ok(None)
}

/// A logged-in session holding the unwrapped DEK and the bearer token.
pub struct Session {
    client: Arc<ApiClient>,
    config: SharedConfig,
    dek: Option<DataEncryptionKey>,
    max_secret_size: u32,
    cache: Option<Cache>,
    sync: Option<SyncHandle>,
    cancel: CancellationToken,
    cache_stopped: Option<oneshot::Receiver<()>>,
}

impl Session {
    pub fn new(client: Arc<ApiClient>, config: SharedConfig) -> Self {
        Self {
            client,
            config,
            dek: None,
            max_secret_size: 0,
            cache: None,
            sync: None,
            cancel: CancellationToken::new(),
            cache_stopped: None,
        }
    }

    /// Authenticate and unwrap the DEK.
    ///
    /// Returns [`AgentError::SecondFactorRequired`] when 2FA is enabled and
    /// no code was supplied; the caller prompts and retries. In local mode
    /// the cache and the sync engine are started, reporting status lines on
    /// `status_tx`.
    pub async fn login(
        &mut self,
        password: &str,
        otp_code: &str,
        status_tx: mpsc::Sender<&'static str>,
    ) -> Result<()> {
        let (username, secret_key, mode) = {
            let config = self.config.read().expect("config lock");
            (
                config.user.clone(),
                config.secretkey.clone(),
                config.mode,
            )
        };

        let response = self.client.login(&username, password, otp_code).await?;
        if response.second_factor {
            return Err(AgentError::SecondFactorRequired);
        }

        let token = response.token.ok_or(AgentError::MissedServerResponse)?;
        let ekey = response.ekey.ok_or(AgentError::MissedServerResponse)?;
        let limits = response
            .server_limits
            .ok_or(AgentError::MissedServerResponse)?;

        let mut dek_bytes = unseal_with_passphrase(secret_key.as_bytes(), &ekey)
            .map_err(|_| AgentError::DekDecryptionFailed)?;
        let dek = DataEncryptionKey::from_slice(&dek_bytes)
            .map_err(|_| AgentError::DekDecryptionFailed)?;
        dek_bytes.zeroize();

        self.client.set_token(token);
        self.dek = Some(dek);
        self.max_secret_size = limits.max_secret_size;

        if mode == AgentMode::Local {
            self.start_local(status_tx)?;
        }

        Ok(())
    }

    /// Open the cache and launch the background synchronizer.
    fn start_local(&mut self, status_tx: mpsc::Sender<&'static str>) -> Result<()> {
        let (dir, username, interval) = {
            let config = self.config.read().expect("config lock");
            (config.data_dir(), config.user.clone(), config.sync_interval())
        };

        let (cache, stopped) = Cache::connect(&dir, &username, self.cancel.child_token())?;

        let engine = SyncEngine::new(self.client.clone(), cache.clone(), status_tx);
        let handle = engine.start(interval, self.cancel.child_token());
        handle.force_background();

        self.cache = Some(cache);
        self.sync = Some(handle);
        self.cache_stopped = Some(stopped);
        Ok(())
    }

    /// End the session: stop background work, wait a bounded interval for
    /// the cache to close, clear the DEK and the token.
    pub async fn logout(&mut self) {
        self.cancel.cancel();

        if let Some(stopped) = self.cache_stopped.take() {
            if tokio::time::timeout(WAIT_FOR_CLOSING_INTERVAL, stopped)
                .await
                .is_err()
            {
                tracing::warn!("cache close timed out; proceeding with logout");
            }
        }

        self.sync = None;
        self.cache = None;
        self.dek = None;
        self.client.clear_token();
    }

    fn dek(&self) -> Result<&DataEncryptionKey> {
        self.dek.as_ref().ok_or(AgentError::NotLoggedIn)
    }

    fn mode(&self) -> AgentMode {
        self.config.read().expect("config lock").mode
    }

    fn cache(&self) -> Result<&Cache> {
        self.cache.as_ref().ok_or(AgentError::CacheClosed)
    }

    /// Short item list, from the cache in local mode.
    pub async fn list_items(&self) -> Result<Vec<proto::ItemSummary>> {
        match self.mode() {
            AgentMode::Local => {
                let entries = self.cache()?.get_items_list()?;
                Ok(entries
                    .into_iter()
                    .map(|entry| proto::ItemSummary {
                        id: entry.id,
                        name: entry.name,
                        item_type: entry.item_type,
                        updated: None,
                        hash: entry.hash,
                    })
                    .collect())
            }
            AgentMode::Server => self.client.get_item_list().await,
        }
    }

    /// Fetch and unseal one item.
    pub async fn get_item(&self, name: &str, item_type: model::ItemType) -> Result<model::Item> {
        let mut wire = match self.mode() {
            AgentMode::Local => {
                let blob = self.cache()?.get_item(name, item_type.as_code())?;
                serde_json::from_slice(&blob)?
            }
            AgentMode::Server => self.client.get_item(name, item_type.as_code()).await?,
        };

        open_item_fields(self.dek()?, &mut wire)?;
        Ok(model::Item::from_proto(&wire)?)
    }

    /// Create or update an item, depending on its id.
    ///
    /// The full envelope is sealed and uploaded on every save. On update in
    /// local mode, a stale cache triggers the per-item hash check; a
    /// mismatch aborts with [`AgentError::OutOfSync`] before anything is
    /// sent.
    pub async fn save_item(&self, item: &model::Item) -> Result<()> {
        let mut wire = item.to_proto()?;
        seal_item_fields(self.dek()?, &mut wire, self.max_secret_size)?;

        if wire.id > 0 {
            if self.mode() == AgentMode::Local {
                self.check_remote_changes(&wire).await?;
            }
            self.client.update_item(wire).await?;
        } else {
            self.client.create_item(wire).await?;
        }

        self.force_sync_and_wait().await;
        Ok(())
    }

    /// Optimistic-concurrency guard: with revisions out of step, the update
    /// may only proceed if the server still holds the hash we started from.
    async fn check_remote_changes(&self, item: &proto::Item) -> Result<()> {
        let server_revision = self.client.get_revision().await?;
        let local_revision = self.cache()?.get_revision()?;
        if server_revision == local_revision {
            return Ok(());
        }

        let server_hash = self
            .client
            .get_item_hash(item.id)
            .await
            .map_err(|_| AgentError::OutOfSync)?;
        if server_hash != item.hash {
            return Err(AgentError::OutOfSync);
        }
        Ok(())
    }

    /// Delete an item on the server (and, via forced sync, from the cache).
    pub async fn delete_item(&self, id: i64) -> Result<()> {
        self.client.delete_item(id).await?;
        self.force_sync_and_wait().await;
        Ok(())
    }

    /// Full account record of the logged-in user.
    pub async fn account(&self) -> Result<proto::User> {
        self.client.get_user().await
    }

    /// Delete the account, its server-side items and the local cache file.
    pub async fn delete_account(&mut self) -> Result<()> {
        self.client.delete_user().await?;
        if let Some(cache) = self.cache.take() {
            cache.delete()?;
        }
        self.logout().await;
        Ok(())
    }

    /// Force one synchronization cycle and wait for it to finish.
    /// No-op in server mode.
    pub async fn sync_now(&self) {
        self.force_sync_and_wait().await;
    }

    async fn force_sync_and_wait(&self) {
        if let Some(handle) = &self.sync {
            handle.force_and_wait().await;
        }
    }
}

/// Seal every non-empty sub-blob of an item in place.
///
/// Empty stays empty. Fails with [`AgentError::SecretTooBig`] when the
/// sealed secret exceeds the server-advertised ceiling.
pub fn seal_item_fields(
    dek: &DataEncryptionKey,
    item: &mut proto::Item,
    max_secret_size: u32,
) -> Result<()> {
    seal_field(dek, &mut item.secrets.secret)?;
    seal_field(dek, &mut item.secrets.notes)?;
    seal_field(dek, &mut item.additions.uris)?;
    seal_field(dek, &mut item.additions.custom_fields)?;

    if let Some(secret) = &item.secrets.secret {
        let max = max_secret_size as usize;
        if secret.len() > max {
            return Err(AgentError::SecretTooBig {
                got: secret.len(),
                max,
            });
        }
    }
    Ok(())
}

/// Unseal every non-empty sub-blob of an item in place.
pub fn open_item_fields(dek: &DataEncryptionKey, item: &mut proto::Item) -> Result<()> {
    open_field(dek, &mut item.secrets.secret)?;
    open_field(dek, &mut item.secrets.notes)?;
    open_field(dek, &mut item.additions.uris)?;
    open_field(dek, &mut item.additions.custom_fields)?;
    Ok(())
}

fn seal_field(dek: &DataEncryptionKey, field: &mut Option<Vec<u8>>) -> Result<()> {
    if let Some(plaintext) = field.as_deref() {
        if !plaintext.is_empty() {
            *field = Some(seal(dek.as_bytes(), plaintext)?);
        }
    }
    Ok(())
}

fn open_field(dek: &DataEncryptionKey, field: &mut Option<Vec<u8>>) -> Result<()> {
    if let Some(ciphertext) = field.as_deref() {
        if !ciphertext.is_empty() {
            *field = Some(unseal(dek.as_bytes(), ciphertext)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keywarden_core::model::{CustomField, CustomFieldKind, Item, ItemType, SecretPayload, Uri};

    fn sample_item() -> Item {
        Item {
            name: "seclogin1".to_string(),
            item_type: ItemType::Login,
            notes: "remember the VPN".to_string(),
            secret: Some(SecretPayload::Login {
                username: "testuser".to_string(),
                password: "testpwd".to_string(),
                authkey: String::new(),
            }),
            uris: vec![Uri {
                uri: "https://example.com".to_string(),
                matching: "domain".to_string(),
            }],
            custom_fields: vec![CustomField {
                name: "pin".to_string(),
                kind: CustomFieldKind::Hidden,
                text_value: "9999".to_string(),
                bool_value: false,
            }],
            ..Item::default()
        }
    }

    #[test]
    fn validate_new_user_rules() {
        let valid = NewUser {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            password_confirm: "hunter2".to_string(),
            secret_key: "cisco-123".to_string(),
            ..NewUser::default()
        };
        assert!(validate_new_user(&valid).is_ok());

        let mut empty_password = valid.clone();
        empty_password.password.clear();
        empty_password.password_confirm.clear();
        assert!(validate_new_user(&empty_password).is_err());

        let mut mismatch = valid.clone();
        mismatch.password_confirm = "other".to_string();
        assert!(validate_new_user(&mismatch).is_err());

        let mut no_key = valid;
        no_key.secret_key.clear();
        assert!(validate_new_user(&no_key).is_err());
    }

    #[test]
    fn envelope_roundtrip() {
        let dek = DataEncryptionKey::generate();
        let item = sample_item();

        let mut wire = item.to_proto().unwrap();
        let cleartext_secret = wire.secrets.secret.clone().unwrap();

        seal_item_fields(&dek, &mut wire, 1024 * 1024).unwrap();
        assert_ne!(wire.secrets.secret.as_ref().unwrap(), &cleartext_secret);
        // Sealed blobs never leak the payload.
        let sealed = wire.secrets.secret.as_ref().unwrap();
        assert!(!sealed.windows(7).any(|w| w == b"testpwd"));

        open_item_fields(&dek, &mut wire).unwrap();
        assert_eq!(Item::from_proto(&wire).unwrap(), item);
    }

    #[test]
    fn empty_fields_stay_empty() {
        let dek = DataEncryptionKey::generate();
        let mut wire = proto::Item {
            name: "bare".to_string(),
            item_type: "n".to_string(),
            ..proto::Item::default()
        };

        seal_item_fields(&dek, &mut wire, 1024).unwrap();
        assert!(wire.secrets.secret.is_none());
        assert!(wire.secrets.notes.is_none());
        assert!(wire.additions.uris.is_none());
        assert!(wire.additions.custom_fields.is_none());
    }

    #[test]
    fn oversized_secret_rejected_after_sealing() {
        let dek = DataEncryptionKey::generate();
        let mut wire = proto::Item {
            name: "big".to_string(),
            item_type: "d".to_string(),
            secrets: proto::Secrets {
                notes: None,
                secret: Some(vec![0u8; 100]),
            },
            ..proto::Item::default()
        };

        let err = seal_item_fields(&dek, &mut wire, 64).unwrap_err();
        match err {
            AgentError::SecretTooBig { got, max } => {
                assert_eq!(max, 64);
                assert!(got > 100, "sealed size includes envelope overhead");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wrong_dek_fails_to_open() {
        let dek = DataEncryptionKey::generate();
        let other = DataEncryptionKey::generate();

        let mut wire = sample_item().to_proto().unwrap();
        seal_item_fields(&dek, &mut wire, 1024 * 1024).unwrap();
        assert!(open_item_fields(&other, &mut wire).is_err());
    }
}
