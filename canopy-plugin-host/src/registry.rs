//! Persisted plugin registry.
//!
//! The registry is the single source of truth for which plugins are installed
//! and enabled. It is seeded from a [`RegistryPersistence`] port on
//! construction and republishes the complete record list on a
//! `tokio::sync::watch` channel after every mutation. Writers always
//! read-modify-write the whole list: a mutation is persisted first and only
//! committed to memory (and published) once the write succeeded.

use canopy_package::{EntrySource, PluginManifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::PluginHostError;
use crate::permissions::PermissionSet;

/// Where a plugin record came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginSource {
    #[default]
    Local,
    Builtin,
}

/// Host-owned state for one installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub manifest: PluginManifest,
    pub enabled: bool,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub source: PluginSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_source: Option<EntrySource>,
}

impl PluginRecord {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    /// Capabilities declared by the manifest.
    pub fn permissions(&self) -> PermissionSet {
        PermissionSet::new(self.manifest.permissions.iter().copied())
    }
}

/// Options for [`RegistryStore::install`]. Absent values keep the existing
/// record's state on update and use the defaults (`disabled`, `local`, no
/// embedded entry) for new records.
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub enabled: Option<bool>,
    pub source: Option<PluginSource>,
    pub entry_source: Option<EntrySource>,
}

/// Storage port for the registry's record list.
pub trait RegistryPersistence: Send + Sync {
    fn load(&self) -> Result<Vec<PluginRecord>, PluginHostError>;
    fn save(&self, records: &[PluginRecord]) -> Result<(), PluginHostError>;
}

/// Keeps the record list in memory only.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<PluginRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a port pre-seeded with records (as if loaded from disk).
    pub fn with_records(records: Vec<PluginRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

impl RegistryPersistence for MemoryPersistence {
    fn load(&self) -> Result<Vec<PluginRecord>, PluginHostError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| PluginHostError::Registry("memory persistence poisoned".into()))?
            .clone())
    }

    fn save(&self, records: &[PluginRecord]) -> Result<(), PluginHostError> {
        *self
            .records
            .lock()
            .map_err(|_| PluginHostError::Registry("memory persistence poisoned".into()))? =
            records.to_vec();
        Ok(())
    }
}

/// Stores the record list as a pretty-printed JSON file.
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryPersistence for JsonFilePersistence {
    fn load(&self) -> Result<Vec<PluginRecord>, PluginHostError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No registry file yet, starting empty");
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            PluginHostError::Registry(format!("failed to read {}: {e}", self.path.display()))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, records: &[PluginRecord]) -> Result<(), PluginHostError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PluginHostError::Registry(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let contents = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).map_err(|e| {
            PluginHostError::Registry(format!("failed to write {}: {e}", tmp.display()))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            PluginHostError::Registry(format!("failed to replace {}: {e}", self.path.display()))
        })
    }
}

/// Reactive, persisted store of plugin records keyed by manifest id.
pub struct RegistryStore {
    persistence: Box<dyn RegistryPersistence>,
    records: Mutex<Vec<PluginRecord>>,
    publisher: watch::Sender<Vec<PluginRecord>>,
}

impl RegistryStore {
    /// Creates a store seeded from `persistence`.
    pub fn new(persistence: impl RegistryPersistence + 'static) -> Result<Self, PluginHostError> {
        let records = persistence.load()?;
        info!(count = records.len(), "Plugin registry loaded");
        let (publisher, _) = watch::channel(records.clone());
        Ok(Self {
            persistence: Box::new(persistence),
            records: Mutex::new(records),
            publisher,
        })
    }

    /// Creates an empty, non-persistent store.
    pub fn in_memory() -> Self {
        let (publisher, _) = watch::channel(Vec::new());
        Self {
            persistence: Box::new(MemoryPersistence::new()),
            records: Mutex::new(Vec::new()),
            publisher,
        }
    }

    pub fn get_all(&self) -> Vec<PluginRecord> {
        self.publisher.borrow().clone()
    }

    pub fn get_by_id(&self, id: &str) -> Option<PluginRecord> {
        self.publisher.borrow().iter().find(|r| r.id() == id).cloned()
    }

    /// Subscribes to the full record list. The receiver starts with the
    /// current list marked as seen.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PluginRecord>> {
        self.publisher.subscribe()
    }

    /// Inserts or updates the record for `manifest.id`.
    pub fn install(
        &self,
        manifest: PluginManifest,
        options: InstallOptions,
    ) -> Result<PluginRecord, PluginHostError> {
        let id = manifest.id.clone();
        let record = self.commit(|records| {
            let now = Utc::now();
            match records.iter_mut().find(|r| r.manifest.id == manifest.id) {
                Some(existing) => {
                    existing.manifest = manifest;
                    existing.updated_at = now;
                    if let Some(enabled) = options.enabled {
                        existing.enabled = enabled;
                    }
                    if let Some(source) = options.source {
                        existing.source = source;
                    }
                    if let Some(entry) = options.entry_source {
                        existing.entry_source = Some(entry);
                    }
                    existing.clone()
                }
                None => {
                    let record = PluginRecord {
                        manifest,
                        enabled: options.enabled.unwrap_or(false),
                        installed_at: now,
                        updated_at: now,
                        source: options.source.unwrap_or_default(),
                        entry_source: options.entry_source,
                    };
                    records.push(record.clone());
                    record
                }
            }
        })?;
        info!(plugin_id = %id, version = %record.manifest.version, "Plugin installed");
        Ok(record)
    }

    /// Removes a record. Returns `false` when no record had that id.
    pub fn uninstall(&self, id: &str) -> Result<bool, PluginHostError> {
        let removed = self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.manifest.id != id);
            (records.len() != before).then_some(())
        })?;
        if removed.is_some() {
            info!(plugin_id = %id, "Plugin uninstalled");
        }
        Ok(removed.is_some())
    }

    /// Enables or disables a plugin. Returns `false` when the record is
    /// absent or already in the requested state.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, PluginHostError> {
        let changed = self.mutate(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.manifest.id == id && r.enabled != enabled)?;
            record.enabled = enabled;
            record.updated_at = Utc::now();
            Some(())
        })?;
        if changed.is_some() {
            info!(plugin_id = %id, enabled, "Plugin enablement changed");
        }
        Ok(changed.is_some())
    }

    /// Applies `change` to a copy of the list, then persists, commits and
    /// publishes the copy.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut Vec<PluginRecord>) -> T,
    ) -> Result<T, PluginHostError> {
        let mut records = self.lock_records()?;
        let mut next = records.clone();
        let outcome = change(&mut next);
        self.publish(&mut records, next)?;
        Ok(outcome)
    }

    /// Like [`commit`](Self::commit), but a `None` from `change` leaves
    /// everything untouched.
    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Vec<PluginRecord>) -> Option<T>,
    ) -> Result<Option<T>, PluginHostError> {
        let mut records = self.lock_records()?;
        let mut next = records.clone();
        let Some(outcome) = change(&mut next) else {
            return Ok(None);
        };
        self.publish(&mut records, next)?;
        Ok(Some(outcome))
    }

    fn lock_records(&self) -> Result<MutexGuard<'_, Vec<PluginRecord>>, PluginHostError> {
        self.records
            .lock()
            .map_err(|_| PluginHostError::Registry("registry lock poisoned".into()))
    }

    fn publish(
        &self,
        records: &mut Vec<PluginRecord>,
        next: Vec<PluginRecord>,
    ) -> Result<(), PluginHostError> {
        self.persistence.save(&next)?;
        *records = next.clone();
        self.publisher.send_replace(next);
        Ok(())
    }
}
