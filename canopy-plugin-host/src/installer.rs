//! Installs distributable plugin archives into the registry.

use canopy_package::PluginArchive;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::PluginHostError;
use crate::registry::{InstallOptions, PluginRecord, PluginSource, RegistryStore};

pub struct PackageInstaller {
    registry: Arc<RegistryStore>,
}

impl PackageInstaller {
    pub fn new(registry: Arc<RegistryStore>) -> Self {
        Self { registry }
    }

    /// Extracts an archive held in memory and records it as a disabled local
    /// plugin with its entry embedded. The registry is untouched on failure.
    pub fn install_archive(&self, bytes: &[u8]) -> Result<PluginRecord, PluginHostError> {
        let archive = PluginArchive::from_bytes(bytes)?;
        info!(
            plugin_id = %archive.manifest.id,
            manifest = %archive.manifest_path,
            entry = %archive.entry_path,
            "Installing plugin archive"
        );
        self.registry.install(
            archive.manifest,
            InstallOptions {
                enabled: Some(false),
                source: Some(PluginSource::Local),
                entry_source: Some(archive.entry_source),
            },
        )
    }

    pub fn install_file(&self, path: impl AsRef<Path>) -> Result<PluginRecord, PluginHostError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            PluginHostError::ManifestInvalid(canopy_package::PackageError::Io(e))
        })?;
        self.install_archive(&bytes)
    }
}
