//! Typed item model: item kinds, secret payload variants, custom fields.
//!
//! Secret payloads are serialized with a single fixed JSON codec before
//! sealing. Existing ciphertexts are never re-encoded, so the codec must
//! not change without a schema version.

use crate::{proto, CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of a stored item. Only `Login` carries URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Login,
    Card,
    SecNote,
    SecData,
}

impl ItemType {
    /// Single-character code used on the wire and in storage.
    pub fn as_code(self) -> &'static str {
        match self {
            ItemType::Login => "l",
            ItemType::Card => "c",
            ItemType::SecNote => "n",
            ItemType::SecData => "d",
        }
    }

    /// Parse the single-character storage code.
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "l" => Ok(ItemType::Login),
            "c" => Ok(ItemType::Card),
            "n" => Ok(ItemType::SecNote),
            "d" => Ok(ItemType::SecData),
            other => Err(CoreError::InvalidInput(format!(
                "unknown item type code '{other}'"
            ))),
        }
    }

    /// All known item types.
    pub fn all() -> [ItemType; 4] {
        [
            ItemType::Login,
            ItemType::Card,
            ItemType::SecNote,
            ItemType::SecData,
        ]
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemType::Login => "login",
            ItemType::Card => "card",
            ItemType::SecNote => "secure note",
            ItemType::SecData => "secure data",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ItemType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "login" | "l" => Ok(ItemType::Login),
            "card" | "c" => Ok(ItemType::Card),
            "note" | "secnote" | "secure note" | "n" => Ok(ItemType::SecNote),
            "data" | "secdata" | "secure data" | "d" => Ok(ItemType::SecData),
            other => Err(CoreError::InvalidInput(format!(
                "unknown item type '{other}'"
            ))),
        }
    }
}

/// Kind of a user-defined custom field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomFieldKind {
    Text,
    Hidden,
    Bool,
}

/// A user-defined extra field attached to an item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub name: String,
    pub kind: CustomFieldKind,
    #[serde(default)]
    pub text_value: String,
    #[serde(default)]
    pub bool_value: bool,
}

/// A URI attached to a login item, with its match rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uri {
    pub uri: String,
    #[serde(rename = "match", default)]
    pub matching: String,
}

/// Type-specific secret payload of an item.
///
/// Secure notes have no payload; their content lives in the item notes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecretPayload {
    Login {
        username: String,
        password: String,
        #[serde(default)]
        authkey: String,
    },
    Card {
        cardholder: String,
        number: String,
        exp_month: u8,
        exp_year: u8,
        cvv: u16,
    },
    Data {
        #[serde(with = "proto::base64_bytes")]
        bytes: Vec<u8>,
    },
}

impl SecretPayload {
    /// Serialize the payload with the fixed codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize a payload previously produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// One-line representation with sensitive parts masked.
    pub fn display_masked(&self) -> String {
        match self {
            SecretPayload::Login { username, password, .. } => format!(
                "username: {} | password: {} | authkey: {}",
                username,
                mask_left(password, 2),
                mask_all(8)
            ),
            SecretPayload::Card { cardholder, number, .. } => format!(
                "cardholder: {} | number: {} | exp: {}/{} | cvv: {}",
                cardholder,
                mask_left(number, 4),
                mask_all(2),
                mask_all(2),
                mask_all(3)
            ),
            SecretPayload::Data { bytes } => format!("binary data ({} bytes)", bytes.len()),
        }
    }
}

/// Mask all but the last `keep` characters of a value.
pub fn mask_left(value: &str, keep: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= keep {
        return "*".repeat(chars.len());
    }
    let masked = "*".repeat(chars.len() - keep);
    let tail: String = chars[chars.len() - keep..].iter().collect();
    format!("{masked}{tail}")
}

/// A fully masked placeholder of the given width.
pub fn mask_all(width: usize) -> String {
    "*".repeat(width)
}

/// Agent-side decrypted view of an item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Server-assigned id; 0 means not yet persisted.
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub reprompt: bool,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub secret: Option<SecretPayload>,
    #[serde(default)]
    pub uris: Vec<Uri>,
    #[serde(default)]
    pub custom_fields: Vec<CustomField>,
}

impl Default for ItemType {
    fn default() -> Self {
        ItemType::Login
    }
}

impl Item {
    /// Convert into the wire representation with cleartext sub-blobs.
    ///
    /// Sealing happens afterwards in the agent session; URIs are only
    /// attached for login items.
    pub fn to_proto(&self) -> Result<proto::Item> {
        let secret = match &self.secret {
            Some(payload) => Some(payload.to_bytes()?),
            None => None,
        };

        let uris = if self.item_type == ItemType::Login && !self.uris.is_empty() {
            Some(serde_json::to_vec(&self.uris)?)
        } else {
            None
        };

        let custom_fields = if self.custom_fields.is_empty() {
            None
        } else {
            Some(serde_json::to_vec(&self.custom_fields)?)
        };

        Ok(proto::Item {
            id: self.id,
            name: self.name.clone(),
            item_type: self.item_type.as_code().to_string(),
            reprompt: self.reprompt,
            updated: self.updated.clone(),
            hash: self.hash.clone(),
            secrets: proto::Secrets {
                notes: if self.notes.is_empty() {
                    None
                } else {
                    Some(self.notes.clone().into_bytes())
                },
                secret,
            },
            additions: proto::Additions {
                uris,
                custom_fields,
            },
        })
    }

    /// Build from a wire item whose sub-blobs are already unsealed.
    pub fn from_proto(item: &proto::Item) -> Result<Self> {
        let item_type = ItemType::from_code(&item.item_type)?;

        let notes = match &item.secrets.notes {
            Some(bytes) if !bytes.is_empty() => String::from_utf8(bytes.clone())
                .map_err(|_| CoreError::InvalidInput("notes are not valid UTF-8".to_string()))?,
            _ => String::new(),
        };

        let secret = match &item.secrets.secret {
            Some(bytes) if !bytes.is_empty() => Some(SecretPayload::from_bytes(bytes)?),
            _ => None,
        };

        let uris = match &item.additions.uris {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes)?,
            _ => Vec::new(),
        };

        let custom_fields = match &item.additions.custom_fields {
            Some(bytes) if !bytes.is_empty() => serde_json::from_slice(bytes)?,
            _ => Vec::new(),
        };

        Ok(Item {
            id: item.id,
            name: item.name.clone(),
            item_type,
            reprompt: item.reprompt,
            updated: item.updated.clone(),
            hash: item.hash.clone(),
            notes,
            secret,
            uris,
            custom_fields,
        })
    }
}
