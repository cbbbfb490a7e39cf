//! Canopy plugin host.
//!
//! Runs third-party plugins in Wasmtime sandboxes, one thread per plugin,
//! and answers their host-API calls after checking the capabilities they
//! declared in their manifest. The orchestrator keeps running sandboxes in
//! line with the persisted registry.

#[cfg(feature = "debug-console")]
pub mod admin;
pub mod config;
pub mod error;
pub mod host_api;
pub mod installer;
pub mod orchestrator;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod storage;

pub use error::PluginHostError;
pub use host_api::{CallContext, CrdtDocument, DocAccessor, HostApi, Notifier, TracingNotifier};
pub use installer::PackageInstaller;
pub use orchestrator::{
    CommandRegistration, CommandRegistry, HostCommand, HostCommandLabel, InMemoryCommandRegistry,
    PluginOrchestrator,
};
pub use permissions::{HostMethod, PermissionSet, check_permission};
pub use registry::{
    InstallOptions, JsonFilePersistence, MemoryPersistence, PluginRecord, PluginSource,
    RegistryPersistence, RegistryStore,
};
pub use runtime::{SandboxRuntime, SandboxState};
pub use sandbox::ResourceLimits;
pub use storage::{KeyValueStore, MemoryKeyValueStore, PluginStorage, SqliteKeyValueStore};
