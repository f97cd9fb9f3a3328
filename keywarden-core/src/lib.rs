//! Keywarden Core Library
//!
//! Shared building blocks for the keywarden server and agent:
//! the crypto envelope, TOTP support, the typed item model, and
//! the wire protocol messages.

pub mod crypto;
pub mod model;
pub mod proto;
pub mod totp;

pub use crypto::cipher::{seal, seal_with_passphrase, unseal, unseal_with_passphrase};
pub use crypto::{CryptoError, DataEncryptionKey};
pub use model::{CustomField, CustomFieldKind, Item, ItemType, SecretPayload, Uri};

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// General error type for core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
