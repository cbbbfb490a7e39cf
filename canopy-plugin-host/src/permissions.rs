//! Capability-based permission model for plugin host calls.
//!
//! Every host-API method is a variant of [`HostMethod`]; the static table in
//! [`HostMethod::required_capability`] maps it to the capability a plugin
//! must have declared in its manifest. The table is deny-by-default: a method
//! is only callable without a capability when it is listed as exempt.
//! Method names outside the enum are rejected before the table is consulted.

use canopy_package::Capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::PluginHostError;

/// A host-API method callable from inside a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostMethod {
    #[serde(rename = "ui.showToast")]
    ShowToast,
    #[serde(rename = "command.register")]
    RegisterCommand,
    #[serde(rename = "command.execute")]
    ExecuteCommand,
    #[serde(rename = "storage.get")]
    StorageGet,
    #[serde(rename = "storage.set")]
    StorageSet,
    #[serde(rename = "storage.remove")]
    StorageRemove,
    #[serde(rename = "doc.getSnapshot")]
    DocSnapshot,
    #[serde(rename = "net.fetch")]
    Fetch,
}

impl HostMethod {
    pub const ALL: [HostMethod; 8] = [
        HostMethod::ShowToast,
        HostMethod::RegisterCommand,
        HostMethod::ExecuteCommand,
        HostMethod::StorageGet,
        HostMethod::StorageSet,
        HostMethod::StorageRemove,
        HostMethod::DocSnapshot,
        HostMethod::Fetch,
    ];

    /// Wire name used in `call` messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ShowToast => "ui.showToast",
            Self::RegisterCommand => "command.register",
            Self::ExecuteCommand => "command.execute",
            Self::StorageGet => "storage.get",
            Self::StorageSet => "storage.set",
            Self::StorageRemove => "storage.remove",
            Self::DocSnapshot => "doc.getSnapshot",
            Self::Fetch => "net.fetch",
        }
    }

    /// Capability a plugin must hold to call this method.
    /// `None` marks an intentional exemption.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            // Exempt.
            Self::ShowToast => None,
            Self::RegisterCommand | Self::ExecuteCommand => Some(Capability::CommandRegister),
            Self::StorageGet | Self::StorageSet | Self::StorageRemove => {
                Some(Capability::StorageLocal)
            }
            Self::DocSnapshot => Some(Capability::DocRead),
            Self::Fetch => Some(Capability::NetFetch),
        }
    }
}

impl fmt::Display for HostMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HostMethod {
    type Err = PluginHostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.name() == s)
            .ok_or_else(|| PluginHostError::UnknownMethod(s.to_string()))
    }
}

/// Capabilities granted to one plugin, fixed at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet {
    granted: BTreeSet<Capability>,
}

impl PermissionSet {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            granted: capabilities.into_iter().collect(),
        }
    }

    /// Creates a set with every capability granted (for testing).
    pub fn all_granted() -> Self {
        Self::new(Capability::ALL)
    }

    pub fn is_granted(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    /// Returns all granted capabilities.
    pub fn granted(&self) -> &BTreeSet<Capability> {
        &self.granted
    }

    /// Checks whether `plugin_id` holding this set may call `method`.
    pub fn check(&self, plugin_id: &str, method: HostMethod) -> Result<(), PluginHostError> {
        match method.required_capability() {
            None => Ok(()),
            Some(capability) if self.is_granted(capability) => Ok(()),
            Some(capability) => Err(PluginHostError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                method: method.name().to_string(),
                capability,
            }),
        }
    }
}

/// Checks a wire method name against a plugin's permissions.
///
/// Fails with `UnknownMethod` for names outside [`HostMethod`], and with
/// `PermissionDenied` when the mapped capability was not declared.
pub fn check_permission(
    plugin_id: &str,
    permissions: &PermissionSet,
    method: &str,
) -> Result<HostMethod, PluginHostError> {
    let method: HostMethod = method.parse()?;
    permissions.check(plugin_id, method)?;
    Ok(method)
}
