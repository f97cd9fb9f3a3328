//! SQLite-backed user/item store.
//!
//! The store owns two server-side invariants: the per-item hash
//! (`SHA-256(name|type|updated)`) and the per-user revision token, replaced
//! inside the same transaction as every item mutation. A successful revision
//! bump is the commit fence; any earlier failure aborts the whole mutation.

use crate::error::StoreError;
use chrono::{SecondsFormat, Utc};
use keywarden_core::proto;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// AEAD envelope overhead on a sealed blob: 12-byte nonce + 16-byte tag.
const SEAL_OVERHEAD: u32 = 28;

type Result<T> = std::result::Result<T, StoreError>;

/// Thread-safe handle to the vault database.
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    max_secret_size: u32,
}

impl Storage {
    /// Open (and create if needed) the database file.
    pub fn open(path: &Path, max_secret_size: u32) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, max_secret_size)
    }

    /// In-memory store for tests.
    pub fn in_memory(max_secret_size: u32) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, max_secret_size)
    }

    fn with_connection(conn: Connection, max_secret_size: u32) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        // journal_mode returns the resulting mode as a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_secret_size,
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE CHECK (username <> ''),
                email TEXT UNIQUE,
                pwdhash TEXT NOT NULL CHECK (pwdhash <> ''),
                otpkey TEXT,
                ekey BLOB NOT NULL CHECK (length(ekey) > 0),
                revision BLOB,
                updated TEXT,
                regdate TEXT
            );

            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users (id) ON DELETE CASCADE,
                name TEXT NOT NULL CHECK (name <> ''),
                type TEXT NOT NULL CHECK (type IN ('l', 'c', 'n', 'd')),
                reprompt INTEGER NOT NULL DEFAULT 0,
                updated TEXT,
                hash BLOB,
                UNIQUE (user_id, name, type)
            );

            CREATE TABLE IF NOT EXISTS secrets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL UNIQUE REFERENCES items (id) ON DELETE CASCADE,
                notes BLOB,
                secret BLOB CHECK (secret IS NULL OR length(secret) <= {max_secret})
            );

            CREATE TABLE IF NOT EXISTS additions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL UNIQUE REFERENCES items (id) ON DELETE CASCADE,
                uris BLOB,
                custom_fields BLOB
            );

            CREATE INDEX IF NOT EXISTS idx_items_user ON items (user_id);",
            max_secret = self.max_secret_size + SEAL_OVERHEAD,
        ))?;
        Ok(())
    }

    /// Maximum cleartext secret size accepted by this store.
    pub fn max_secret_size(&self) -> u32 {
        self.max_secret_size
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("lock poisoned: {e}")))
    }

    // --- Users ---

    /// Create a new user. `regdate` and `updated` are assigned here.
    pub fn create_user(&self, user: &proto::User) -> Result<()> {
        validate_username(&user.username)?;
        if let Some(email) = user.email.as_deref() {
            validate_email(email)?;
        }
        let pwdhash = user
            .pwdhash
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StoreError::constraint("pwdhash must not be empty"))?;
        let ekey = user
            .ekey
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StoreError::constraint("ekey must not be empty"))?;

        let regdate = now_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO users (username, email, pwdhash, otpkey, ekey, updated, regdate)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![user.username, user.email, pwdhash, user.otpkey, ekey, regdate],
        )?;
        Ok(())
    }

    /// Fetch a full user row by username.
    pub fn get_user_by_name(&self, username: &str) -> Result<proto::User> {
        let conn = self.lock()?;
        let user = conn.query_row(
            "SELECT username, email, pwdhash, otpkey, ekey, revision, updated, regdate
             FROM users WHERE username = ?1",
            [username],
            |row| {
                Ok(proto::User {
                    username: row.get(0)?,
                    email: row.get(1)?,
                    pwdhash: row.get(2)?,
                    otpkey: row.get(3)?,
                    ekey: row.get(4)?,
                    revision: row.get(5)?,
                    updated: row.get(6)?,
                    regdate: row.get(7)?,
                })
            },
        )?;
        Ok(user)
    }

    /// Password hash and OTP key (empty string when 2FA is disabled).
    pub fn get_user_auth(&self, username: &str) -> Result<(String, String)> {
        let conn = self.lock()?;
        let row = conn.query_row(
            "SELECT pwdhash, coalesce(otpkey, '') FROM users WHERE username = ?1",
            [username],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(row)
    }

    /// Wrapped data-encryption key of a user.
    pub fn get_user_dek(&self, username: &str) -> Result<Vec<u8>> {
        let conn = self.lock()?;
        let ekey = conn.query_row(
            "SELECT ekey FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        Ok(ekey)
    }

    /// Current revision token; empty until the first item mutation.
    pub fn get_user_revision(&self, username: &str) -> Result<Vec<u8>> {
        let conn = self.lock()?;
        let revision: Option<Vec<u8>> = conn.query_row(
            "SELECT revision FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        Ok(revision.unwrap_or_default())
    }

    /// Update user fields. Absent fields keep their stored value;
    /// `username` and `regdate` are immutable.
    pub fn update_user(&self, user: &proto::User) -> Result<()> {
        if let Some(email) = user.email.as_deref() {
            validate_email(email)?;
        }

        let conn = self.lock()?;
        let affected = conn.execute(
            "UPDATE users SET
                email = coalesce(?1, email),
                pwdhash = coalesce(?2, pwdhash),
                otpkey = coalesce(?3, otpkey),
                ekey = coalesce(?4, ekey),
                revision = coalesce(?5, revision),
                updated = ?6
             WHERE username = ?7",
            params![
                user.email,
                user.pwdhash,
                user.otpkey,
                user.ekey,
                user.revision,
                now_rfc3339(),
                user.username
            ],
        )?;

        if affected < 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Delete a user and cascade to all owned items.
    pub fn delete_user(&self, username: &str) -> Result<()> {
        let conn = self.lock()?;
        let affected = conn.execute("DELETE FROM users WHERE username = ?1", [username])?;
        if affected < 1 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // --- Items ---

    /// Create a new item for a user.
    ///
    /// `updated` and `hash` are computed here; `additions.uris` is discarded
    /// for non-login items. The owner's revision is replaced in the same
    /// transaction.
    pub fn create_item(&self, username: &str, item: &proto::Item) -> Result<()> {
        validate_item_type(&item.item_type)?;
        if item.name.is_empty() {
            return Err(StoreError::constraint("item name must not be empty"));
        }
        self.check_secret_size(&item.secrets)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(tx_failed)?;

        let user_id: i64 = tx
            .query_row("SELECT id FROM users WHERE username = ?1", [username], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let updated = now_rfc3339();
        let hash = item_digest(&item.name, &item.item_type, &updated);

        tx.execute(
            "INSERT INTO items (user_id, name, type, reprompt, updated, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![user_id, item.name, item.item_type, item.reprompt, updated, hash],
        )?;
        let item_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO secrets (item_id, notes, secret) VALUES (?1, ?2, ?3)",
            params![item_id, item.secrets.notes, item.secrets.secret],
        )?;

        let uris = login_only_uris(&item.item_type, &item.additions);
        tx.execute(
            "INSERT INTO additions (item_id, uris, custom_fields) VALUES (?1, ?2, ?3)",
            params![item_id, uris, item.additions.custom_fields],
        )?;

        bump_revision(
            &tx,
            username,
            &mutation_revision(username, &item.name, &item.item_type, &updated),
        )?;

        tx.commit().map_err(tx_failed)
    }

    /// Fetch a full item by its unique `(owner, name, type)` key.
    ///
    /// Sub-blobs are returned verbatim, still sealed.
    pub fn get_item_by_name_and_type(
        &self,
        username: &str,
        name: &str,
        item_type: &str,
    ) -> Result<proto::Item> {
        let conn = self.lock()?;
        let item = conn.query_row(
            &format!(
                "{ITEM_SELECT} WHERE users.username = ?1 AND items.name = ?2 AND items.type = ?3"
            ),
            params![username, name, item_type],
            row_to_item,
        )?;
        Ok(item)
    }

    /// Batch fetch of full items, preserving the order of `ids`.
    ///
    /// Ids that no longer exist for this user are skipped.
    pub fn get_items_by_id(&self, username: &str, ids: &[i64]) -> Result<Vec<proto::Item>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{ITEM_SELECT} WHERE users.username = ?1 AND items.id = ?2"))?;

        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(item) = stmt
                .query_row(params![username, id], row_to_item)
                .optional()?
            {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Current hash of an item, for the optimistic-concurrency check.
    pub fn get_item_hash_by_id(&self, id: i64) -> Result<Vec<u8>> {
        let conn = self.lock()?;
        let hash = conn.query_row("SELECT hash FROM items WHERE id = ?1", [id], |row| {
            row.get(0)
        })?;
        Ok(hash)
    }

    /// Short representation of all items of a user, sorted by name.
    pub fn get_item_list(&self, username: &str) -> Result<Vec<proto::ItemSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT items.id, items.name, items.type, items.updated, items.hash
             FROM items JOIN users ON items.user_id = users.id
             WHERE users.username = ?1
             ORDER BY items.name ASC",
        )?;

        let items = stmt
            .query_map([username], |row| {
                Ok(proto::ItemSummary {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    item_type: row.get(2)?,
                    updated: row.get(3)?,
                    hash: row.get::<_, Option<Vec<u8>>>(4)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Update an existing item owned by `username`.
    ///
    /// Recomputes `updated` and `hash`, coalesces absent sub-blobs, discards
    /// URIs for non-login items and bumps the owner's revision, all in one
    /// transaction.
    pub fn update_item(&self, username: &str, item: &proto::Item) -> Result<()> {
        validate_item_type(&item.item_type)?;
        self.check_secret_size(&item.secrets)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(tx_failed)?;

        let updated = now_rfc3339();
        let hash = item_digest(&item.name, &item.item_type, &updated);

        let affected = tx.execute(
            "UPDATE items SET name = ?1, reprompt = ?2, updated = ?3, hash = ?4
             WHERE id = ?5
               AND user_id = (SELECT id FROM users WHERE username = ?6)",
            params![item.name, item.reprompt, updated, hash, item.id, username],
        )?;
        if affected < 1 {
            return Err(StoreError::NotFound);
        }

        tx.execute(
            "UPDATE secrets SET
                notes = coalesce(?1, notes),
                secret = coalesce(?2, secret)
             WHERE item_id = ?3",
            params![item.secrets.notes, item.secrets.secret, item.id],
        )?;

        let uris = login_only_uris(&item.item_type, &item.additions);
        tx.execute(
            "UPDATE additions SET
                uris = coalesce(?1, uris),
                custom_fields = coalesce(?2, custom_fields)
             WHERE item_id = ?3",
            params![uris, item.additions.custom_fields, item.id],
        )?;

        bump_revision(
            &tx,
            username,
            &mutation_revision(username, &item.name, &item.item_type, &updated),
        )?;

        tx.commit().map_err(tx_failed)
    }

    /// Delete an item owned by `username` and bump the revision.
    pub fn delete_item(&self, username: &str, id: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(tx_failed)?;

        let affected = tx.execute(
            "DELETE FROM items
             WHERE id = ?1
               AND user_id = (SELECT id FROM users WHERE username = ?2)",
            params![id, username],
        )?;
        if affected < 1 {
            return Err(StoreError::NotFound);
        }

        bump_revision(&tx, username, &deletion_revision(username, id))?;
        tx.commit().map_err(tx_failed)
    }

    fn check_secret_size(&self, secrets: &proto::Secrets) -> Result<()> {
        if let Some(secret) = &secrets.secret {
            let limit = (self.max_secret_size + SEAL_OVERHEAD) as usize;
            if secret.len() > limit {
                return Err(StoreError::constraint(format!(
                    "secret size {} exceeds limit {}",
                    secret.len(),
                    limit
                )));
            }
        }
        Ok(())
    }
}

const ITEM_SELECT: &str = "SELECT items.id, items.name, items.type, items.reprompt,
        items.updated, items.hash, s.notes, s.secret, a.uris, a.custom_fields
     FROM items
     JOIN users ON items.user_id = users.id
     LEFT JOIN secrets s ON s.item_id = items.id
     LEFT JOIN additions a ON a.item_id = items.id";

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<proto::Item> {
    Ok(proto::Item {
        id: row.get(0)?,
        name: row.get(1)?,
        item_type: row.get(2)?,
        reprompt: row.get(3)?,
        updated: row.get(4)?,
        hash: row.get::<_, Option<Vec<u8>>>(5)?.unwrap_or_default(),
        secrets: proto::Secrets {
            notes: row.get(6)?,
            secret: row.get(7)?,
        },
        additions: proto::Additions {
            uris: row.get(8)?,
            custom_fields: row.get(9)?,
        },
    })
}

/// URIs are only meaningful for login items; everything else loses them.
fn login_only_uris<'a>(item_type: &str, additions: &'a proto::Additions) -> Option<&'a [u8]> {
    if item_type == "l" {
        additions.uris.as_deref()
    } else {
        None
    }
}

fn bump_revision(tx: &Transaction<'_>, username: &str, revision: &[u8]) -> Result<()> {
    let affected = tx.execute(
        "UPDATE users SET revision = ?1 WHERE username = ?2",
        params![revision, username],
    )?;
    if affected < 1 {
        return Err(StoreError::TransactionFailed {
            reason: "no rows affected by revision bump".to_string(),
            source: None,
        });
    }
    Ok(())
}

fn tx_failed(err: rusqlite::Error) -> StoreError {
    StoreError::TransactionFailed {
        reason: "transaction aborted".to_string(),
        source: Some(err),
    }
}

/// RFC-3339 timestamp with microsecond precision, so that two mutations in
/// the same second still produce distinct item hashes.
fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn item_digest(name: &str, item_type: &str, updated: &str) -> Vec<u8> {
    Sha256::digest(format!("{name}|{item_type}|{updated}")).to_vec()
}

fn mutation_revision(username: &str, name: &str, item_type: &str, updated: &str) -> Vec<u8> {
    Sha256::digest(format!("{username}|{name}|{item_type}|{updated}")).to_vec()
}

fn deletion_revision(username: &str, id: i64) -> Vec<u8> {
    Sha256::digest(format!("{username}|{id}|{}", now_rfc3339())).to_vec()
}

fn validate_username(username: &str) -> Result<()> {
    let ok = !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !ok {
        return Err(StoreError::constraint(format!(
            "username '{username}' contains forbidden characters"
        )));
    }
    Ok(())
}

fn validate_email(email: &str) -> Result<()> {
    let ok = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    if !ok {
        return Err(StoreError::constraint(format!("invalid email '{email}'")));
    }
    Ok(())
}

fn validate_item_type(item_type: &str) -> Result<()> {
    if !matches!(item_type, "l" | "c" | "n" | "d") {
        return Err(StoreError::constraint(format!(
            "unknown item type '{item_type}'"
        )));
    }
    Ok(())
}
