//! Error types for the plugin host.

use canopy_package::{Capability, PackageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("invalid plugin package: {0}")]
    ManifestInvalid(#[from] PackageError),

    #[error("permission denied: plugin '{plugin_id}' lacks '{capability}' capability for {method}")]
    PermissionDenied {
        plugin_id: String,
        method: String,
        capability: Capability,
    },

    #[error(
        "storage quota exceeded: plugin '{plugin_id}' uses {used} bytes, write needs {requested}, limit is {limit}"
    )]
    QuotaExceeded {
        plugin_id: String,
        used: usize,
        requested: usize,
        limit: usize,
    },

    #[error("storage busy: plugin '{plugin_id}' already has a write in progress")]
    StorageBusy { plugin_id: String },

    #[error("unknown host method: {0}")]
    UnknownMethod(String),

    #[error("invalid arguments for {method}: {message}")]
    InvalidArguments { method: String, message: String },

    #[error("plugin '{plugin_id}' failed: {message}")]
    SandboxExecution { plugin_id: String, message: String },

    #[error("sandbox for plugin '{0}' has been stopped")]
    SandboxStopped(String),

    #[error("wasm compilation error: {0}")]
    Compilation(#[from] wasmtime::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for PluginHostError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
