//! Per-plugin key-value storage with a byte quota.
//!
//! Plugins share one [`KeyValueStore`] backend. Each plugin's keys live under
//! a length-prefixed namespace (`canopy:plugin:{len}:{id}:`), so no plugin id
//! can produce a prefix that covers another plugin's keys. Values are stored
//! as JSON text.
//!
//! Usage is counted the way browser storage budgets count it: two bytes per
//! UTF-16 code unit of every stored full key plus value.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::PluginHostError;

/// Default per-plugin budget: 5 MiB.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

const KEY_NAMESPACE: &str = "canopy:plugin:";

/// Flat string key-value backend shared by all plugins.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, PluginHostError>;
    fn set(&self, key: &str, value: &str) -> Result<(), PluginHostError>;
    fn remove(&self, key: &str) -> Result<(), PluginHostError>;
    /// Returns every `(key, value)` pair whose key starts with `prefix`.
    fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PluginHostError>;
}

/// In-process backend.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, PluginHostError> {
        self.entries
            .lock()
            .map_err(|_| PluginHostError::Storage("memory store lock poisoned".into()))
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, PluginHostError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PluginHostError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PluginHostError> {
        self.entries()?.remove(key);
        Ok(())
    }

    fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PluginHostError> {
        Ok(self
            .entries()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// SQLite-backed store, one `plugin_kv` table.
pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PluginHostError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PluginHostError::Storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            PluginHostError::Storage(format!("failed to open plugin storage: {e}"))
        })?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, PluginHostError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, PluginHostError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS plugin_kv (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, PluginHostError> {
        self.conn
            .lock()
            .map_err(|_| PluginHostError::Storage("sqlite connection lock poisoned".into()))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, PluginHostError> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM plugin_kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PluginHostError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO plugin_kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PluginHostError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM plugin_kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, PluginHostError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM plugin_kv
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// Namespace prefix for a plugin's keys.
pub fn plugin_prefix(plugin_id: &str) -> String {
    format!("{KEY_NAMESPACE}{}:{plugin_id}:", plugin_id.len())
}

/// Bytes charged for one stored entry.
pub fn entry_size(full_key: &str, value: &str) -> usize {
    2 * (full_key.encode_utf16().count() + value.encode_utf16().count())
}

/// Quota-enforcing view over a [`KeyValueStore`], scoped by plugin id.
pub struct PluginStorage {
    backend: Arc<dyn KeyValueStore>,
    quota_bytes: usize,
    writers: Mutex<HashSet<String>>,
}

/// Held for the duration of one `set`; releases the plugin's write lock on drop.
struct WriteGuard<'a> {
    writers: &'a Mutex<HashSet<String>>,
    plugin_id: String,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut writers) = self.writers.lock() {
            writers.remove(&self.plugin_id);
        }
    }
}

impl PluginStorage {
    pub fn new(backend: Arc<dyn KeyValueStore>, quota_bytes: usize) -> Self {
        Self {
            backend,
            quota_bytes,
            writers: Mutex::new(HashSet::new()),
        }
    }

    /// In-memory storage with the default quota.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyValueStore::new()), DEFAULT_QUOTA_BYTES)
    }

    pub fn quota_bytes(&self) -> usize {
        self.quota_bytes
    }

    pub fn get(&self, plugin_id: &str, key: &str) -> Result<Option<Value>, PluginHostError> {
        let full_key = format!("{}{key}", plugin_prefix(plugin_id));
        match self.backend.get(&full_key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Stores `value` under `key` if the plugin's projected usage stays
    /// within the quota. Nothing is written when the write is rejected.
    pub fn set(&self, plugin_id: &str, key: &str, value: &Value) -> Result<(), PluginHostError> {
        let _guard = self.try_lock_writes(plugin_id)?;

        let prefix = plugin_prefix(plugin_id);
        let full_key = format!("{prefix}{key}");
        let raw = serde_json::to_string(value)?;

        let used: usize = self
            .backend
            .entries_with_prefix(&prefix)?
            .iter()
            .filter(|(k, _)| *k != full_key)
            .map(|(k, v)| entry_size(k, v))
            .sum();
        let requested = entry_size(&full_key, &raw);

        if used + requested > self.quota_bytes {
            warn!(
                plugin_id = %plugin_id,
                used,
                requested,
                limit = self.quota_bytes,
                "Storage quota exceeded"
            );
            return Err(PluginHostError::QuotaExceeded {
                plugin_id: plugin_id.to_string(),
                used,
                requested,
                limit: self.quota_bytes,
            });
        }

        self.backend.set(&full_key, &raw)?;
        debug!(plugin_id = %plugin_id, key, bytes = requested, "Plugin storage write");
        Ok(())
    }

    pub fn remove(&self, plugin_id: &str, key: &str) -> Result<(), PluginHostError> {
        let full_key = format!("{}{key}", plugin_prefix(plugin_id));
        self.backend.remove(&full_key)
    }

    /// Bytes currently charged to the plugin.
    pub fn usage(&self, plugin_id: &str) -> Result<usize, PluginHostError> {
        Ok(self
            .backend
            .entries_with_prefix(&plugin_prefix(plugin_id))?
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum())
    }

    /// Keys the plugin has stored, without the namespace prefix.
    pub fn keys(&self, plugin_id: &str) -> Result<Vec<String>, PluginHostError> {
        let prefix = plugin_prefix(plugin_id);
        Ok(self
            .backend
            .entries_with_prefix(&prefix)?
            .into_iter()
            .filter_map(|(k, _)| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    /// Takes the non-reentrant per-plugin write lock. A second writer is
    /// rejected with `StorageBusy` rather than queued.
    fn try_lock_writes(&self, plugin_id: &str) -> Result<WriteGuard<'_>, PluginHostError> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| PluginHostError::Storage("write lock table poisoned".into()))?;
        if !writers.insert(plugin_id.to_string()) {
            return Err(PluginHostError::StorageBusy {
                plugin_id: plugin_id.to_string(),
            });
        }
        Ok(WriteGuard {
            writers: &self.writers,
            plugin_id: plugin_id.to_string(),
        })
    }
}
