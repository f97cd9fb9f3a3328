//! TOTP (RFC 6238) support for two-factor login.
//!
//! Codes are 6 digits, SHA-1, 30-second period. Verification accepts one
//! period of clock skew in either direction.

use crate::{CoreError, Result};
use data_encoding::{BASE32, BASE32_NOPAD};
use hmac::{Hmac, Mac};
use qrcode::QrCode;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::io::Cursor;

type HmacSha1 = Hmac<Sha1>;

/// Code length in digits.
const DIGITS: u32 = 6;
/// Rotation period in seconds.
const PERIOD: u64 = 30;
/// Raw secret length in bytes before base32 encoding.
const SECRET_LEN: usize = 20;
/// Rendered QR code edge length in pixels.
const QR_SIZE: u32 = 240;

/// Enrolment material handed to a user that enables two-factor login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpEnrolment {
    /// Base32-encoded shared secret.
    pub secret: String,
    /// `otpauth://totp/...` provisioning URL.
    pub url: String,
    /// PNG image of the provisioning URL.
    pub qr_png: Vec<u8>,
}

/// Generate a fresh TOTP secret with provisioning URL and QR code.
pub fn generate_enrolment(username: &str, issuer: &str) -> Result<TotpEnrolment> {
    let mut raw = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    let secret = BASE32_NOPAD.encode(&raw);

    let url = format!(
        "otpauth://totp/{issuer}:{username}?secret={secret}&issuer={issuer}&algorithm=SHA1&digits={DIGITS}&period={PERIOD}"
    );

    let qr_png = render_qr_png(&url)?;

    Ok(TotpEnrolment {
        secret,
        url,
        qr_png,
    })
}

/// Generate the code for a secret at the given Unix timestamp.
pub fn generate_code_at(secret_base32: &str, timestamp: i64) -> Result<String> {
    let secret = decode_secret(secret_base32)?;
    let counter = (timestamp.max(0) as u64) / PERIOD;
    hotp(&secret, counter)
}

/// Generate the currently valid code for a secret.
pub fn generate_current_code(secret_base32: &str) -> Result<String> {
    generate_code_at(secret_base32, chrono::Utc::now().timestamp())
}

/// Check a code against a secret, allowing one period of skew.
pub fn verify_code(code: &str, secret_base32: &str) -> bool {
    let now = chrono::Utc::now().timestamp();
    for skew in [0i64, -1, 1] {
        let at = now + skew * PERIOD as i64;
        if let Ok(expected) = generate_code_at(secret_base32, at) {
            if expected == code.trim() {
                return true;
            }
        }
    }
    false
}

fn hotp(secret: &[u8], counter: u64) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(secret)
        .map_err(|_| CoreError::InvalidInput("invalid TOTP secret".to_string()))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = ((digest[offset] as u32 & 0x7f) << 24)
        | ((digest[offset + 1] as u32) << 16)
        | ((digest[offset + 2] as u32) << 8)
        | (digest[offset + 3] as u32);

    let code = binary % 10u32.pow(DIGITS);
    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

fn decode_secret(secret_base32: &str) -> Result<Vec<u8>> {
    let normalized = secret_base32
        .trim()
        .replace([' ', '-'], "")
        .to_ascii_uppercase();

    let decoded = BASE32_NOPAD
        .decode(normalized.as_bytes())
        .or_else(|_| BASE32.decode(normalized.as_bytes()))
        .map_err(|_| CoreError::InvalidInput("TOTP secret must be valid base32".to_string()))?;

    if decoded.is_empty() {
        return Err(CoreError::InvalidInput(
            "TOTP secret cannot decode to empty bytes".to_string(),
        ));
    }

    Ok(decoded)
}

fn render_qr_png(url: &str) -> Result<Vec<u8>> {
    let code = QrCode::new(url.as_bytes())
        .map_err(|e| CoreError::InvalidInput(format!("QR encoding failed: {e}")))?;

    let img = code
        .render::<image::Luma<u8>>()
        .max_dimensions(QR_SIZE, QR_SIZE)
        .build();

    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageOutputFormat::Png)
        .map_err(|e| CoreError::InvalidInput(format!("QR rendering failed: {e}")))?;

    Ok(png)
}
