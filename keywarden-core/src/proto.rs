//! Wire protocol messages shared by the server and the agent.
//!
//! Every `Vec<u8>` field that corresponds to sealed content is opaque
//! ciphertext and travels base64-encoded inside JSON. Optional sub-blobs
//! use `None` to mean "absent"; the store keeps the existing value on
//! update when a sub-blob is absent.

use serde::{Deserialize, Serialize};

/// Wire error codes, stable across transports.
pub mod code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
    pub const INTERNAL: &str = "INTERNAL";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// Metadata header carrying the asserted identity.
pub const USERNAME_HEADER: &str = "x-username";

/// Error body returned by the server for any failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub error: String,
}

/// User account record.
///
/// Optional fields follow coalescing update semantics: `None` keeps the
/// stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub pwdhash: Option<String>,
    #[serde(default)]
    pub otpkey: Option<String>,
    #[serde(default, with = "base64_bytes_opt")]
    pub ekey: Option<Vec<u8>>,
    #[serde(default, with = "base64_bytes_opt")]
    pub revision: Option<Vec<u8>>,
    #[serde(default)]
    pub regdate: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

/// Sealed secret sub-blobs of an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Secrets {
    #[serde(default, with = "base64_bytes_opt")]
    pub notes: Option<Vec<u8>>,
    #[serde(default, with = "base64_bytes_opt")]
    pub secret: Option<Vec<u8>>,
}

/// Sealed addition sub-blobs of an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Additions {
    #[serde(default, with = "base64_bytes_opt")]
    pub uris: Option<Vec<u8>>,
    #[serde(default, with = "base64_bytes_opt")]
    pub custom_fields: Option<Vec<u8>>,
}

/// Full item record as it travels over the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Server-assigned id; 0 means new, not yet persisted.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub reprompt: bool,
    /// RFC-3339 timestamp, server-assigned.
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default, with = "base64_bytes")]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub additions: Additions,
}

/// Short item representation used by list and diff operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default, with = "base64_bytes")]
    pub hash: Vec<u8>,
}

/// Server-advertised limits returned at login.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServerLimits {
    pub max_secret_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
    pub user: User,
    #[serde(default)]
    pub two_factor: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotpKey {
    pub secret: String,
    #[serde(with = "base64_bytes")]
    pub qr_png: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserResponse {
    pub info: String,
    #[serde(default)]
    pub totp_key: Option<TotpKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub otp_code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginResponse {
    /// Set when 2FA is enabled and no code was supplied; no token issued.
    #[serde(default)]
    pub second_factor: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, with = "base64_bytes_opt")]
    pub ekey: Option<Vec<u8>>,
    #[serde(default)]
    pub server_limits: Option<ServerLimits>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserResponse {
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionResponse {
    #[serde(with = "base64_bytes")]
    pub revision: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateUserRequest {
    pub user: User,
}

/// Generic confirmation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateItemRequest {
    pub username: String,
    pub item: Item,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetItemRequest {
    pub username: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemListRequest {
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetItemsRequest {
    pub username: String,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemHashRequest {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemHashResponse {
    #[serde(with = "base64_bytes")]
    pub hash: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateItemRequest {
    pub username: String,
    pub item: Item,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteItemRequest {
    pub username: String,
    pub id: i64,
}

/// Base64 serialization for `Vec<u8>` fields.
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Base64 serialization for `Option<Vec<u8>>` fields.
pub mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let value: Option<String> = Option::deserialize(d)?;
        match value {
            Some(s) => STANDARD
                .decode(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_bytes_travel_as_base64() {
        let item = Item {
            id: 3,
            name: "n".to_string(),
            item_type: "l".to_string(),
            reprompt: false,
            updated: Some("2026-01-02T03:04:05Z".to_string()),
            hash: vec![0xde, 0xad],
            secrets: Secrets {
                notes: Some(vec![1, 2, 3]),
                secret: None,
            },
            additions: Additions::default(),
        };

        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"3q0=\""));

        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn absent_sub_blobs_deserialize_as_none() {
        let back: Item =
            serde_json::from_str(r#"{"name":"x","type":"l","hash":""}"#).unwrap();
        assert!(back.secrets.notes.is_none());
        assert!(back.secrets.secret.is_none());
        assert!(back.additions.uris.is_none());
        assert_eq!(back.id, 0);
    }

    #[test]
    fn login_response_defaults() {
        let resp: LoginResponse = serde_json::from_str(r#"{"second_factor":true}"#).unwrap();
        assert!(resp.second_factor);
        assert!(resp.token.is_none());
        assert!(resp.ekey.is_none());
    }
}
