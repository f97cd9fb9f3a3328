//! Keywarden Agent Library
//!
//! The user-facing side of the vault: configuration, the authenticated
//! RPC client, the offline cache, the synchronization engine and the
//! session that holds the unwrapped data-encryption key.

pub mod cache;
pub mod client;
pub mod config;
pub mod session;
pub mod sync;

use thiserror::Error;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent-visible error kinds, stable across transports.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The server rejected our token; the UI must re-login.
    #[error("session expired")]
    SessionExpired,

    #[error("second factor is required")]
    SecondFactorRequired,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("failed to encrypt data encryption key")]
    DekEncryptionFailed,

    /// The secret key is wrong or the wrapped DEK is corrupt.
    #[error("failed to decrypt data encryption key")]
    DekDecryptionFailed,

    #[error("secret is too big: sealed size {got} bytes, server limit {max} bytes")]
    SecretTooBig { got: usize, max: usize },

    /// Optimistic-concurrency guard tripped; refresh and retry.
    #[error("local and server state are out of sync")]
    OutOfSync,

    #[error("missed server response")]
    MissedServerResponse,

    #[error("not found")]
    NotFound,

    #[error("cache is closed")]
    CacheClosed,

    /// Any other server failure, with its wire code intact.
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Core(#[from] keywarden_core::CoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] keywarden_core::CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
