//! Host configuration, read from `~/.canopy/config.toml`.
//!
//! Every key is optional. A missing file means defaults; a file that cannot
//! be read or parsed is reported and also falls back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::PluginHostError;
use crate::sandbox::ResourceLimits;
use crate::storage::DEFAULT_QUOTA_BYTES;

pub const CONFIG_FILE: &str = "config.toml";
pub const REGISTRY_FILE: &str = "plugins.json";
pub const STORAGE_FILE: &str = "storage.db";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Per-plugin storage budget in bytes.
    pub quota_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: DEFAULT_QUOTA_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_memory_bytes: usize,
    pub fuel_per_call: u64,
    pub stop_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            max_memory_bytes: limits.max_memory_bytes,
            fuel_per_call: limits.fuel_per_call,
            stop_grace_ms: limits.stop_grace_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Where the registry and plugin storage live. Defaults to `~/.canopy`.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub paths: PathsConfig,
}

impl HostConfig {
    /// Loads `~/.canopy/config.toml` if it exists.
    pub fn load() -> Self {
        Self::load_from(default_data_dir().join(CONFIG_FILE))
    }

    /// Loads config from an explicit path, falling back to defaults.
    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            info!("No config file found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded host config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("{e}. Falling back to default config ({:?}).", path);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, PluginHostError> {
        toml::from_str(contents).map_err(|e| PluginHostError::Config(format!("invalid config: {e}")))
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            max_memory_bytes: self.sandbox.max_memory_bytes,
            fuel_per_call: self.sandbox.fuel_per_call,
            stop_grace_ms: self.sandbox.stop_grace_ms,
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.paths.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir().join(REGISTRY_FILE)
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir().join(STORAGE_FILE)
    }
}

/// Resolve the Canopy data directory.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".canopy")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".canopy")
    } else {
        PathBuf::from(".canopy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn load_config_from_str(toml_content: &str) -> HostConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, toml_content).unwrap();
        HostConfig::load_from(path)
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::load_from(dir.path().join("nonexistent.toml"));
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.storage.quota_bytes, 5 * 1024 * 1024);
    }

    #[test]
    fn load_from_full_file() {
        let config = load_config_from_str(
            r#"
[storage]
quota_bytes = 1024

[sandbox]
max_memory_bytes = 1048576
fuel_per_call = 10000
stop_grace_ms = 250

[paths]
data_dir = "/var/lib/canopy"
"#,
        );
        assert_eq!(config.storage.quota_bytes, 1024);
        assert_eq!(
            config.resource_limits(),
            ResourceLimits {
                max_memory_bytes: 1_048_576,
                fuel_per_call: 10_000,
                stop_grace_ms: 250,
            }
        );
        assert_eq!(config.registry_path(), PathBuf::from("/var/lib/canopy/plugins.json"));
        assert_eq!(config.storage_path(), PathBuf::from("/var/lib/canopy/storage.db"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = load_config_from_str("[sandbox]\nstop_grace_ms = 10\n");
        assert_eq!(config.sandbox.stop_grace_ms, 10);
        assert_eq!(config.sandbox.fuel_per_call, ResourceLimits::default().fuel_per_call);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn load_from_malformed_file_falls_back_to_defaults() {
        let config = load_config_from_str("this is not valid toml {{{{");
        assert_eq!(config, HostConfig::default());
    }

    #[test]
    fn load_from_unreadable_path_falls_back_to_defaults() {
        // A directory exists but cannot be read as a file.
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(HostConfig::load_from(dir.path()), HostConfig::default());
    }

    #[test]
    fn wrong_type_is_a_config_error() {
        let err = HostConfig::from_toml_str("[storage]\nquota_bytes = \"lots\"\n").unwrap_err();
        assert!(matches!(err, PluginHostError::Config(_)));
    }
}
