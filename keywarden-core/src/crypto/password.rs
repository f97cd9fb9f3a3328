//! Server-side password hashing.
//!
//! Passwords are hashed into PHC strings with Argon2id and verified in
//! constant time. The hash travels from the agent to the server at
//! registration, so the server never sees the cleartext password either.

use crate::crypto::{CryptoError, Result};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};

/// Hash a password into a salted PHC string.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| CryptoError::HashFailed(e.to_string()))?;

    Ok(hash.to_string())
}

/// Verify a password against a stored PHC string.
///
/// Any failure (malformed hash, mismatch) yields `false`; the comparison
/// itself is constant-time.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
