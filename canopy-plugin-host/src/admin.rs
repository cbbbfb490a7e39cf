//! Administrative console for manual testing of the plugin host.
//!
//! Compiled with the `debug-console` feature (on by default). Production
//! embedders that expose their own management UI can turn it off.

use canopy_package::{Capability, CommandContribution, EntrySource, PluginManifest};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::PluginHostError;
use crate::installer::PackageInstaller;
use crate::registry::{InstallOptions, PluginRecord, PluginSource, RegistryStore};

pub const DEMO_PLUGIN_ID: &str = "canopy.demo";
pub const DEMO_COMMAND_ID: &str = "canopy.demo.hello";

/// One row of [`DebugConsole::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub source: PluginSource,
    pub permissions: Vec<String>,
    pub commands: Vec<String>,
    pub has_entry: bool,
}

impl From<&PluginRecord> for PluginSummary {
    fn from(record: &PluginRecord) -> Self {
        Self {
            id: record.manifest.id.clone(),
            name: record.manifest.name.clone(),
            version: record.manifest.version.clone(),
            enabled: record.enabled,
            source: record.source,
            permissions: record
                .manifest
                .permissions
                .iter()
                .map(|c| c.to_string())
                .collect(),
            commands: record
                .manifest
                .contributes
                .command_ids()
                .into_iter()
                .map(str::to_string)
                .collect(),
            has_entry: record.entry_source.is_some(),
        }
    }
}

pub struct DebugConsole {
    registry: Arc<RegistryStore>,
    installer: PackageInstaller,
}

impl DebugConsole {
    pub fn new(registry: Arc<RegistryStore>) -> Self {
        Self {
            installer: PackageInstaller::new(Arc::clone(&registry)),
            registry,
        }
    }

    pub fn list(&self) -> Vec<PluginSummary> {
        self.registry.get_all().iter().map(PluginSummary::from).collect()
    }

    /// Installs (or refreshes) the bundled demo plugin, enabled.
    pub fn install_demo(&self) -> Result<PluginRecord, PluginHostError> {
        let record = self.registry.install(
            demo_manifest(),
            InstallOptions {
                enabled: Some(true),
                source: Some(PluginSource::Builtin),
                entry_source: Some(EntrySource::Text(demo_entry())),
            },
        )?;
        info!(plugin_id = DEMO_PLUGIN_ID, "Demo plugin installed");
        Ok(record)
    }

    pub fn install_from_zip(&self, path: impl AsRef<Path>) -> Result<PluginRecord, PluginHostError> {
        self.installer.install_file(path)
    }

    pub fn enable(&self, plugin_id: &str) -> Result<bool, PluginHostError> {
        self.set_enabled(plugin_id, true)
    }

    pub fn disable(&self, plugin_id: &str) -> Result<bool, PluginHostError> {
        self.set_enabled(plugin_id, false)
    }

    /// Returns `false` when no plugin had that id.
    pub fn uninstall(&self, plugin_id: &str) -> Result<bool, PluginHostError> {
        self.registry.uninstall(plugin_id)
    }

    fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<bool, PluginHostError> {
        if self.registry.get_by_id(plugin_id).is_none() {
            return Err(PluginHostError::PluginNotFound(plugin_id.to_string()));
        }
        self.registry.set_enabled(plugin_id, enabled)
    }
}

pub fn demo_manifest() -> PluginManifest {
    let mut manifest = PluginManifest::new(DEMO_PLUGIN_ID, "Canopy Demo", "0.1.0", "demo.wat");
    manifest.author = Some("Canopy".into());
    manifest.description = Some("Greets you from inside the sandbox".into());
    manifest.permissions = vec![Capability::CommandRegister, Capability::StorageLocal];
    manifest.contributes.command.push(CommandContribution {
        id: DEMO_COMMAND_ID.into(),
        title: Some("Say hello".into()),
        icon: Some("sparkles".into()),
        command: None,
    });
    manifest
}

/// Lays out strings as consecutive data segments and remembers where each one
/// starts.
struct DataLayout {
    data: String,
    next: usize,
}

impl DataLayout {
    fn new() -> Self {
        Self {
            data: String::new(),
            next: 16,
        }
    }

    /// Returns `(offset, len)` operands for `text`.
    fn push(&mut self, text: &str) -> String {
        let offset = self.next;
        let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
        self.data
            .push_str(&format!("  (data (i32.const {offset}) \"{escaped}\")\n"));
        self.next += text.len();
        format!("(i32.const {offset}) (i32.const {})", text.len())
    }
}

/// WebAssembly text of the demo plugin: activation logs a line and records a
/// counter, the `invoke` handler shows a toast.
pub fn demo_entry() -> String {
    let mut data = DataLayout::new();
    let activated = data.push("demo plugin activated");
    let deactivated = data.push("demo plugin deactivated");
    let storage_set = data.push("storage.set");
    let mark = data.push(r#"["lastActivation","activated"]"#);
    let toast = data.push("ui.showToast");
    let hello = data.push(r#"["Hello from the Canopy demo plugin!"]"#);

    format!(
        r#"(module
  (import "canopy" "call" (func $call (param i32 i32 i32 i32) (result i32)))
  (import "canopy" "log" (func $log (param i32 i32)))
  (memory (export "memory") 1)
{data}
  (func (export "activate")
    (call $log {activated})
    (drop (call $call {storage_set} {mark})))
  (func (export "deactivate")
    (call $log {deactivated}))
  (func (export "alloc") (param i32) (result i32)
    (i32.const 4096))
  (func (export "invoke") (param i32 i32)
    (drop (call $call {toast} {hello})))
)
"#,
        data = data.data,
    )
}
