//! AES-GCM sealing and unsealing of field bytes.
//!
//! Wire layout of a sealed blob is `nonce(12) || ciphertext || auth_tag(16)`.
//! Passphrase-wrapped blobs additionally carry a trailing 32-byte Argon2id
//! salt: `nonce || ciphertext || tag || salt(32)`.

use crate::crypto::{CryptoError, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{AesGcm, Aes128Gcm, Aes256Gcm};
use aes_gcm::aes::Aes192;

/// AES-192-GCM, built from the generic [`AesGcm`] construction since
/// `aes_gcm` only provides type aliases for the 128- and 256-bit variants.
type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use zeroize::Zeroize;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// Length of the Argon2id salt appended to passphrase-wrapped blobs.
const WRAP_SALT_LEN: usize = 32;

/// A data encryption key (DEK) used to seal item fields.
///
/// The DEK is wrapped with a key derived from the user's secret key and
/// stored on the server in that wrapped form. It only exists in cleartext
/// inside an unlocked agent session.
#[derive(Clone)]
pub struct DataEncryptionKey {
    key: [u8; 32],
}

impl DataEncryptionKey {
    /// Generate a new random data encryption key.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Create a DEK from raw bytes.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Create a DEK from a byte slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { got: bytes.len() })?;
        Ok(Self { key })
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for DataEncryptionKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Seal plaintext under a raw AES key.
///
/// A fresh random nonce is generated per call and prepended to the output.
/// The key selects the cipher: 16 bytes for AES-128, 24 for AES-192,
/// 32 for AES-256.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => seal_with::<Aes128Gcm>(key, plaintext),
        24 => seal_with::<Aes192Gcm>(key, plaintext),
        32 => seal_with::<Aes256Gcm>(key, plaintext),
        got => Err(CryptoError::InvalidKeyLength { got }),
    }
}

/// Unseal a blob produced by [`seal`].
///
/// Fails with [`CryptoError::AuthenticationFailed`] when the tag does not
/// verify or the input is shorter than the nonce.
pub fn unseal(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    match key.len() {
        16 => unseal_with::<Aes128Gcm>(key, sealed),
        24 => unseal_with::<Aes192Gcm>(key, sealed),
        32 => unseal_with::<Aes256Gcm>(key, sealed),
        got => Err(CryptoError::InvalidKeyLength { got }),
    }
}

/// Seal plaintext under a key derived from a passphrase of any length.
///
/// A fresh random 32-byte salt is used for the Argon2id derivation and
/// appended to the sealed output, so only the passphrase is needed to
/// unseal later.
pub fn seal_with_passphrase(passphrase: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = [0u8; WRAP_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut key = derive_key(passphrase, &salt)?;
    let result = seal(&key, plaintext);
    key.zeroize();

    let mut sealed = result?;
    sealed.extend_from_slice(&salt);
    Ok(sealed)
}

/// Unseal a blob produced by [`seal_with_passphrase`].
///
/// A wrong passphrase fails authentication rather than returning garbage.
pub fn unseal_with_passphrase(passphrase: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < WRAP_SALT_LEN {
        return Err(CryptoError::DecryptionFailed(
            "sealed blob shorter than salt".to_string(),
        ));
    }

    let (body, salt) = sealed.split_at(sealed.len() - WRAP_SALT_LEN);

    let mut key = derive_key(passphrase, salt)?;
    let result = unseal(&key, body);
    key.zeroize();

    result
}

fn seal_with<A>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>
where
    A: Aead + AeadCore + KeyInit,
{
    let cipher =
        A::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength { got: key.len() })?;

    let nonce = A::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn unseal_with<A>(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>>
where
    A: Aead + AeadCore + KeyInit,
{
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    let cipher =
        A::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength { got: key.len() })?;

    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(nonce.into(), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Stretch a passphrase into a 32-byte AES key with Argon2id.
fn derive_key(passphrase: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(65_536, 3, 1, Some(32))
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;

    Ok(key)
}
