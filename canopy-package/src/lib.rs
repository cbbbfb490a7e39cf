//! Canopy plugin packages.
//!
//! A plugin is described by a `manifest.json` and ships one executable entry
//! module (WebAssembly text or binary). Distributable archives are zip files:
//! - `manifest.json`: identity, entry path, capabilities, contributions
//! - the entry file the manifest names, relative to the manifest
//!
//! The archive may nest the plugin inside a directory; the shallowest
//! manifest is authoritative.

mod archive;
mod entry;
mod error;
mod manifest;

pub use archive::{ArchiveBuilder, MANIFEST_FILE, PluginArchive};
pub use entry::{EntrySource, WASM_MAGIC};
pub use error::PackageError;
pub use manifest::{
    Capability, CommandContribution, Contributions, EngineRequirement, PluginManifest,
    SettingContribution, ToolbarContribution,
};
