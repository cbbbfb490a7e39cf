//! Plugin manifest (`manifest.json`) as authored by plugin developers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::PackageError;

/// A named right gating access to one or more host-API methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "ui:toolbar")]
    UiToolbar,
    #[serde(rename = "ui:panel")]
    UiPanel,
    #[serde(rename = "command:register")]
    CommandRegister,
    #[serde(rename = "doc:read")]
    DocRead,
    #[serde(rename = "doc:write")]
    DocWrite,
    #[serde(rename = "storage:local")]
    StorageLocal,
    #[serde(rename = "net:fetch")]
    NetFetch,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::UiToolbar,
        Capability::UiPanel,
        Capability::CommandRegister,
        Capability::DocRead,
        Capability::DocWrite,
        Capability::StorageLocal,
        Capability::NetFetch,
    ];

    /// Wire token as written in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UiToolbar => "ui:toolbar",
            Self::UiPanel => "ui:panel",
            Self::CommandRegister => "command:register",
            Self::DocRead => "doc:read",
            Self::DocWrite => "doc:write",
            Self::StorageLocal => "storage:local",
            Self::NetFetch => "net:fetch",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| PackageError::ManifestInvalid(format!("unknown capability '{s}'")))
    }
}

/// Host version requirements declared by the plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// A toolbar button contributed by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolbarContribution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Command id the button triggers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// A command-palette entry contributed by the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandContribution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl CommandContribution {
    /// The id this entry is bridged under: its `command` reference when set.
    pub fn command_id(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.id)
    }
}

/// A user-facing setting declared by the plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingContribution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Declarative contributions. Every list defaults to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributions {
    #[serde(default)]
    pub toolbar: Vec<ToolbarContribution>,
    #[serde(default)]
    pub command: Vec<CommandContribution>,
    #[serde(default)]
    pub setting: Vec<SettingContribution>,
}

impl Contributions {
    /// Command ids referenced by command entries and toolbar buttons,
    /// in declaration order, without duplicates.
    pub fn command_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        let declared = self.command.iter().map(CommandContribution::command_id);
        let toolbar = self.toolbar.iter().filter_map(|t| t.command.as_deref());
        for id in declared.chain(toolbar) {
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Immutable, author-supplied description of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Globally unique plugin identifier (e.g. "acme.word-count").
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Semver version string.
    #[serde(default)]
    pub version: String,
    /// Path of the executable module, relative to the manifest.
    #[serde(default)]
    pub entry: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub engine: EngineRequirement,
    #[serde(default)]
    pub permissions: Vec<Capability>,
    #[serde(default)]
    pub contributes: Contributions,
}

impl PluginManifest {
    /// Creates a manifest with the four required fields and nothing else.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            entry: entry.into(),
            author: None,
            description: None,
            engine: EngineRequirement::default(),
            permissions: Vec::new(),
            contributes: Contributions::default(),
        }
    }

    /// Parses and validates a manifest from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, PackageError> {
        let manifest: PluginManifest = serde_json::from_slice(bytes)
            .map_err(|e| PackageError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Checks that `id`, `name`, `version` and `entry` are present.
    pub fn validate(&self) -> Result<(), PackageError> {
        let required = [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("entry", &self.entry),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(PackageError::ManifestInvalid(format!(
                    "missing required field `{field}`"
                )));
            }
        }
        Ok(())
    }

    pub fn has_permission(&self, capability: Capability) -> bool {
        self.permissions.contains(&capability)
    }
}
