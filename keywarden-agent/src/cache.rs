//! Local item cache: a single-file store for the current user's sealed
//! items and the last applied server revision.
//!
//! Secret data stays sealed at rest; each cached row carries the serialized
//! wire item with its ciphertext fields intact. A background worker closes
//! the file on cancellation and then signals the stop channel; callers
//! must observe that signal before considering the store closed.

use crate::{AgentError, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// One cached item row. `data` is the serialized wire item (still sealed);
/// list queries leave it empty.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub id: i64,
    pub name: String,
    pub item_type: String,
    pub hash: Vec<u8>,
    pub data: Vec<u8>,
}

/// Handle to the on-disk cache of one user.
#[derive(Clone)]
pub struct Cache {
    conn: Arc<Mutex<Option<Connection>>>,
    path: Option<PathBuf>,
}

impl Cache {
    /// Open the cache file for a user, creating the schema idempotently.
    ///
    /// Spawns a worker that closes the store once `shutdown` fires, then
    /// signals the returned stop channel.
    pub fn connect(
        dir: &Path,
        username: &str,
        shutdown: CancellationToken,
    ) -> Result<(Self, oneshot::Receiver<()>)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{username}.cache.db"));
        let conn = Connection::open(&path)?;

        let cache = Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            path: Some(path),
        };
        cache.initialize_schema()?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let conn = cache.conn.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            if let Ok(mut guard) = conn.lock() {
                if let Some(conn) = guard.take() {
                    if let Err((_, e)) = conn.close() {
                        tracing::warn!(error = %e, "failed to close cache cleanly");
                    }
                }
            }
            let _ = stop_tx.send(());
        });

        Ok((cache, stop_rx))
    }

    /// In-memory cache for tests.
    pub fn in_memory() -> Result<Self> {
        let cache = Self {
            conn: Arc::new(Mutex::new(Some(Connection::open_in_memory()?))),
            path: None,
        };
        cache.initialize_schema()?;
        Ok(cache)
    }

    fn initialize_schema(&self) -> Result<()> {
        let guard = self.lock()?;
        let conn = live(&guard)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vault (
                id INTEGER NOT NULL PRIMARY KEY,
                name TEXT NOT NULL,
                type TEXT,
                hash BLOB,
                data BLOB,
                UNIQUE (name, type)
            );
            CREATE TABLE IF NOT EXISTS revision (
                id INTEGER NOT NULL PRIMARY KEY,
                revision BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS item_name_type ON vault (name, type);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO revision (id, revision) VALUES (0, ?1)",
            params![Vec::<u8>::new()],
        )?;
        Ok(())
    }

    /// Remove the cache file from disk, closing the connection first.
    pub fn delete(&self) -> Result<()> {
        if let Ok(mut guard) = self.lock() {
            if let Some(conn) = guard.take() {
                let _ = conn.close();
            }
        }
        if let Some(path) = &self.path {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Last server revision applied to this cache; empty before first sync.
    pub fn get_revision(&self) -> Result<Vec<u8>> {
        let guard = self.lock()?;
        let conn = live(&guard)?;
        let mut stmt = conn.prepare_cached("SELECT revision FROM revision WHERE id = 0")?;
        let revision = stmt.query_row([], |row| row.get(0))?;
        Ok(revision)
    }

    /// Record the server revision the cache now reflects.
    pub fn save_revision(&self, revision: &[u8]) -> Result<()> {
        let guard = self.lock()?;
        let conn = live(&guard)?;
        let mut stmt = conn.prepare_cached("UPDATE revision SET revision = ?1 WHERE id = 0")?;
        stmt.execute([revision])?;
        Ok(())
    }

    /// Insert items fetched from the server, in one transaction.
    ///
    /// Replaces on conflict so that re-applying a partially synced batch
    /// cannot fail.
    pub fn create_items(&self, entries: &[CacheEntry]) -> Result<()> {
        let mut guard = self.lock()?;
        let conn = live_mut(&mut guard)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO vault (id, name, type, hash, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entry in entries {
                stmt.execute(params![
                    entry.id,
                    entry.name,
                    entry.item_type,
                    entry.hash,
                    entry.data
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Serialized item blob by `(name, type)`.
    pub fn get_item(&self, name: &str, item_type: &str) -> Result<Vec<u8>> {
        let guard = self.lock()?;
        let conn = live(&guard)?;
        let mut stmt =
            conn.prepare_cached("SELECT data FROM vault WHERE name = ?1 AND type = ?2")?;
        stmt.query_row(params![name, item_type], |row| row.get(0))
            .optional()?
            .ok_or(AgentError::NotFound)
    }

    /// Short representation of all cached items, sorted by name.
    pub fn get_items_list(&self) -> Result<Vec<CacheEntry>> {
        let guard = self.lock()?;
        let conn = live(&guard)?;
        let mut stmt = conn
            .prepare_cached("SELECT id, name, type, hash FROM vault ORDER BY name ASC")?;

        let entries = stmt
            .query_map([], |row| {
                Ok(CacheEntry {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    item_type: row.get(2)?,
                    hash: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                    data: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Overwrite existing rows with fresh server state, in one transaction.
    ///
    /// Unknown ids are ignored, matching the diff protocol: updates are only
    /// planned for ids present locally.
    pub fn update_items(&self, entries: &[CacheEntry]) -> Result<()> {
        let mut guard = self.lock()?;
        let conn = live_mut(&mut guard)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE vault SET name = ?1, hash = ?2, data = ?3 WHERE id = ?4",
            )?;
            for entry in entries {
                stmt.execute(params![entry.name, entry.hash, entry.data, entry.id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete rows by id, in one transaction. Unknown ids are ignored.
    pub fn delete_items(&self, ids: &[i64]) -> Result<()> {
        let mut guard = self.lock()?;
        let conn = live_mut(&mut guard)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM vault WHERE id = ?1")?;
            for id in ids {
                stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Drop every cached item, leaving the revision row untouched.
    pub fn clear_items(&self) -> Result<()> {
        let guard = self.lock()?;
        let conn = live(&guard)?;
        conn.execute("DELETE FROM vault", [])?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|_| AgentError::Internal("cache lock poisoned".to_string()))
    }
}

fn live<'a>(guard: &'a MutexGuard<'_, Option<Connection>>) -> Result<&'a Connection> {
    guard.as_ref().ok_or(AgentError::CacheClosed)
}

fn live_mut<'a>(guard: &'a mut MutexGuard<'_, Option<Connection>>) -> Result<&'a mut Connection> {
    guard.as_mut().ok_or(AgentError::CacheClosed)
}
