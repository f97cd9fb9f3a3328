//! Cryptographic primitives for the vault.
//!
//! This module provides:
//! - AES-GCM sealing/unsealing of field bytes
//! - Argon2id passphrase wrapping of the data encryption key
//! - Server-side password hashing and verification

pub mod cipher;
pub mod password;

pub use cipher::{
    seal, seal_with_passphrase, unseal, unseal_with_passphrase, DataEncryptionKey,
};
pub use password::{hash_password, verify_password};

use thiserror::Error;

/// Errors that can occur in cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("invalid key length: got {got}, want 16, 24 or 32 bytes")]
    InvalidKeyLength { got: usize },

    #[error("key derivation failed: {0}")]
    KdfFailed(String),

    #[error("authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("password hashing failed: {0}")]
    HashFailed(String),
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
