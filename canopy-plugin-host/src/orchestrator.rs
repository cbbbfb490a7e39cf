//! Lifecycle orchestrator.
//!
//! Reconciles registry state with running sandboxes: every enabled record has
//! exactly one started [`SandboxRuntime`], nothing else runs. Contributed
//! commands of enabled plugins are bridged into the host's
//! [`CommandRegistry`] and retracted when their plugin goes away.

use canopy_package::{EntrySource, PluginManifest};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::PluginHostError;
use crate::host_api::{CallContext, HostApi};
use crate::permissions::PermissionSet;
use crate::registry::{PluginRecord, RegistryStore};
use crate::runtime::SandboxRuntime;
use crate::sandbox::ResourceLimits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommandLabel {
    pub title: String,
    pub sub_title: Option<String>,
}

/// A command as shown in the host's command palette.
#[derive(Clone)]
pub struct HostCommand {
    pub id: String,
    pub label: HostCommandLabel,
    pub icon: Option<String>,
    pub category: String,
    pub run: Arc<dyn Fn() + Send + Sync>,
}

/// Handle returned by [`CommandRegistry::register`]; retracts the command.
pub struct CommandRegistration {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl CommandRegistration {
    pub fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn unregister(mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

/// The host's command palette.
pub trait CommandRegistry: Send + Sync {
    fn register(&self, command: HostCommand) -> CommandRegistration;
}

/// Command registry kept in memory, for headless hosts and tests.
#[derive(Default, Clone)]
pub struct InMemoryCommandRegistry {
    commands: Arc<Mutex<BTreeMap<String, HostCommand>>>,
}

impl InMemoryCommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<HostCommand> {
        self.commands.lock().ok().and_then(|c| c.get(id).cloned())
    }

    /// Runs a registered command. Returns `false` if it is not registered.
    pub fn run(&self, id: &str) -> bool {
        match self.get(id) {
            Some(command) => {
                (command.run)();
                true
            }
            None => false,
        }
    }
}

impl CommandRegistry for InMemoryCommandRegistry {
    fn register(&self, command: HostCommand) -> CommandRegistration {
        let id = command.id.clone();
        if let Ok(mut commands) = self.commands.lock() {
            commands.insert(id.clone(), command);
        }
        let commands = Arc::clone(&self.commands);
        CommandRegistration::new(move || {
            if let Ok(mut commands) = commands.lock() {
                commands.remove(&id);
            }
        })
    }
}

struct RunningInstance {
    runtime: Arc<SandboxRuntime>,
    manifest: PluginManifest,
    entry: Option<EntrySource>,
}

impl RunningInstance {
    /// Whether the instance was started from an older version of `record`.
    fn is_stale(&self, record: &PluginRecord) -> bool {
        self.manifest != record.manifest || self.entry != record.entry_source
    }
}

struct BridgedCommand {
    plugin_id: String,
    label: HostCommandLabel,
    icon: Option<String>,
    category: String,
    registration: CommandRegistration,
}

impl BridgedCommand {
    /// Whether the host-side registration no longer matches `desired`.
    fn differs_from(&self, desired: &DesiredCommand) -> bool {
        self.plugin_id != desired.plugin_id
            || self.label != desired.label
            || self.icon != desired.icon
            || self.category != desired.category
    }
}

struct DesiredCommand {
    plugin_id: String,
    label: HostCommandLabel,
    icon: Option<String>,
    category: String,
}

struct Inner {
    registry: Arc<RegistryStore>,
    host_api: Arc<HostApi>,
    commands: Arc<dyn CommandRegistry>,
    limits: ResourceLimits,
    instances: Mutex<HashMap<String, RunningInstance>>,
    bridged: Mutex<HashMap<String, BridgedCommand>>,
    /// Serializes reconciliation passes.
    sync_lock: tokio::sync::Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps running sandboxes and bridged commands in line with the registry.
#[derive(Clone)]
pub struct PluginOrchestrator {
    inner: Arc<Inner>,
}

impl PluginOrchestrator {
    pub fn new(
        registry: Arc<RegistryStore>,
        host_api: Arc<HostApi>,
        commands: Arc<dyn CommandRegistry>,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                host_api,
                commands,
                limits,
                instances: Mutex::new(HashMap::new()),
                bridged: Mutex::new(HashMap::new()),
                sync_lock: tokio::sync::Mutex::new(()),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<RegistryStore> {
        &self.inner.registry
    }

    pub fn host_api(&self) -> &Arc<HostApi> {
        &self.inner.host_api
    }

    /// Runs one reconciliation pass.
    pub async fn sync(&self) {
        self.inner.sync().await;
    }

    /// Reconciles once now and again after every registry change, until
    /// [`shutdown`](Self::shutdown).
    pub fn watch_registry(&self) {
        let mut changes = self.inner.registry.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { break };
                inner.sync().await;
                drop(inner);
                if changes.changed().await.is_err() {
                    break;
                }
            }
            debug!("Registry watcher finished");
        });
        if let Ok(mut watcher) = self.inner.watcher.lock() {
            if let Some(previous) = watcher.replace(task) {
                previous.abort();
            }
        }
    }

    /// Routes a command to the sandbox that owns it.
    pub fn execute_command(&self, command_id: &str) -> bool {
        self.inner.execute_command(command_id)
    }

    /// Ids of plugins with a started sandbox, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .instances
            .lock()
            .map(|i| i.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn runtime(&self, plugin_id: &str) -> Option<Arc<SandboxRuntime>> {
        self.inner
            .instances
            .lock()
            .ok()
            .and_then(|i| i.get(plugin_id).map(|r| Arc::clone(&r.runtime)))
    }

    /// Issues a host call on behalf of a running plugin, with the
    /// permissions its sandbox was started with. Plugins that are disabled,
    /// uninstalled or failed to start are `PluginNotFound`.
    pub async fn host_call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, PluginHostError> {
        let permissions = self
            .inner
            .instances
            .lock()
            .ok()
            .and_then(|i| {
                i.get(plugin_id)
                    .map(|r| PermissionSet::new(r.manifest.permissions.iter().copied()))
            })
            .ok_or_else(|| PluginHostError::PluginNotFound(plugin_id.to_string()))?;
        let ctx = CallContext::new(plugin_id, permissions);
        self.inner.host_api.dispatch(&ctx, method, args).await
    }

    /// Stops every sandbox and retracts every bridged command.
    pub async fn shutdown(&self) {
        if let Some(watcher) = self.inner.watcher.lock().ok().and_then(|mut w| w.take()) {
            watcher.abort();
        }
        let _pass = self.inner.sync_lock.lock().await;

        let instances: Vec<(String, RunningInstance)> = self
            .inner
            .instances
            .lock()
            .map(|mut i| i.drain().collect())
            .unwrap_or_default();
        for (plugin_id, instance) in instances {
            instance.runtime.stop().await;
            self.inner.host_api.forget_plugin(&plugin_id);
        }

        let bridged: Vec<BridgedCommand> = self
            .inner
            .bridged
            .lock()
            .map(|mut b| b.drain().map(|(_, c)| c).collect())
            .unwrap_or_default();
        for command in bridged {
            command.registration.unregister();
        }
        info!("Plugin orchestrator shut down");
    }
}

impl Inner {
    async fn sync(self: &Arc<Self>) {
        let _pass = self.sync_lock.lock().await;
        let records = self.registry.get_all();
        let enabled: HashMap<&str, &PluginRecord> = records
            .iter()
            .filter(|r| r.enabled)
            .map(|r| (r.id(), r))
            .collect();

        let stale: Vec<(String, RunningInstance)> = match self.instances.lock() {
            Ok(mut instances) => {
                let ids: Vec<String> = instances
                    .iter()
                    .filter(|(id, instance)| {
                        enabled
                            .get(id.as_str())
                            .is_none_or(|record| instance.is_stale(record))
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| instances.remove(&id).map(|i| (id, i)))
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        for (plugin_id, instance) in stale {
            instance.runtime.stop().await;
            self.host_api.forget_plugin(&plugin_id);
            info!(plugin_id = %plugin_id, "Plugin instance retired");
        }

        for record in records.iter().filter(|r| r.enabled) {
            let running = self
                .instances
                .lock()
                .map(|i| i.contains_key(record.id()))
                .unwrap_or(false);
            if running {
                continue;
            }

            let runtime = Arc::new(SandboxRuntime::new(
                record,
                Arc::clone(&self.host_api),
                self.limits.clone(),
            ));
            match runtime.start().await {
                Ok(()) => {
                    if let Ok(mut instances) = self.instances.lock() {
                        instances.insert(
                            record.id().to_string(),
                            RunningInstance {
                                runtime,
                                manifest: record.manifest.clone(),
                                entry: record.entry_source.clone(),
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!(plugin_id = %record.id(), error = %e, "Plugin failed to start");
                }
            }
        }

        self.bridge_commands(&records);
    }

    fn bridge_commands(self: &Arc<Self>, records: &[PluginRecord]) {
        let mut desired: HashMap<String, DesiredCommand> = HashMap::new();
        for record in records.iter().filter(|r| r.enabled) {
            for command_id in record.manifest.contributes.command_ids() {
                if let Some(owner) = desired.get(command_id) {
                    warn!(
                        command_id,
                        owner = %owner.plugin_id,
                        plugin_id = %record.id(),
                        "Command id already contributed, keeping first"
                    );
                    continue;
                }
                desired.insert(command_id.to_string(), describe_command(record, command_id));
            }
        }

        let Ok(mut bridged) = self.bridged.lock() else {
            return;
        };

        let retracted: Vec<String> = bridged
            .iter()
            .filter(|(id, current)| {
                desired
                    .get(id.as_str())
                    .is_none_or(|d| current.differs_from(d))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for command_id in retracted {
            if let Some(command) = bridged.remove(&command_id) {
                debug!(command_id = %command_id, plugin_id = %command.plugin_id, "Command retracted");
                command.registration.unregister();
            }
        }

        let mut added = HashSet::new();
        for (command_id, command) in desired {
            if bridged.contains_key(&command_id) {
                continue;
            }
            let weak: Weak<Inner> = Arc::downgrade(self);
            let run_id = command_id.clone();
            let registration = self.commands.register(HostCommand {
                id: command_id.clone(),
                label: command.label.clone(),
                icon: command.icon.clone(),
                category: command.category.clone(),
                run: Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.execute_command(&run_id);
                    }
                }),
            });
            added.insert(command_id.clone());
            bridged.insert(
                command_id,
                BridgedCommand {
                    plugin_id: command.plugin_id,
                    label: command.label,
                    icon: command.icon,
                    category: command.category,
                    registration,
                },
            );
        }
        if !added.is_empty() {
            debug!(count = added.len(), "Commands bridged");
        }
    }

    fn execute_command(&self, command_id: &str) -> bool {
        let owner = self
            .bridged
            .lock()
            .ok()
            .and_then(|b| b.get(command_id).map(|c| c.plugin_id.clone()));

        let runtime = self.instances.lock().ok().and_then(|instances| match &owner {
            Some(plugin_id) => instances.get(plugin_id).map(|i| Arc::clone(&i.runtime)),
            // Commands registered at runtime via `command.register`.
            None => instances
                .iter()
                .find(|(plugin_id, _)| {
                    self.host_api
                        .registered_commands(plugin_id)
                        .iter()
                        .any(|id| id == command_id)
                })
                .map(|(_, i)| Arc::clone(&i.runtime)),
        });

        match runtime {
            Some(runtime) => runtime.invoke(command_id),
            None => {
                debug!(command_id, "No running plugin owns command");
                false
            }
        }
    }
}

fn describe_command(record: &PluginRecord, command_id: &str) -> DesiredCommand {
    let contributes = &record.manifest.contributes;
    let command = contributes.command.iter().find(|c| c.command_id() == command_id);
    let toolbar = contributes
        .toolbar
        .iter()
        .find(|t| t.command.as_deref() == Some(command_id));

    let title = command
        .and_then(|c| c.title.clone())
        .or_else(|| toolbar.and_then(|t| t.title.clone()))
        .unwrap_or_else(|| command_id.to_string());
    let icon = command
        .and_then(|c| c.icon.clone())
        .or_else(|| toolbar.and_then(|t| t.icon.clone()));

    DesiredCommand {
        plugin_id: record.id().to_string(),
        label: HostCommandLabel {
            title,
            sub_title: record.manifest.description.clone(),
        },
        icon,
        category: record.manifest.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstallOptions;
    use crate::storage::PluginStorage;
    use canopy_package::{CommandContribution, ToolbarContribution};
    use pretty_assertions::assert_eq;

    fn manifest(id: &str, commands: &[&str]) -> PluginManifest {
        let mut manifest = PluginManifest::new(id, format!("Plugin {id}"), "1.0.0", "main.wat");
        manifest.contributes.command = commands
            .iter()
            .map(|c| CommandContribution {
                id: c.to_string(),
                title: Some(format!("Run {c}")),
                icon: None,
                command: None,
            })
            .collect();
        manifest
    }

    /// Records without an entry never start, which keeps these tests free
    /// of wasm while still exercising command bridging.
    fn setup() -> (PluginOrchestrator, InMemoryCommandRegistry) {
        let registry = Arc::new(RegistryStore::in_memory());
        let host_api = Arc::new(HostApi::new(Arc::new(PluginStorage::in_memory())));
        let commands = InMemoryCommandRegistry::new();
        let orchestrator = PluginOrchestrator::new(
            registry,
            host_api,
            Arc::new(commands.clone()),
            ResourceLimits::default(),
        );
        (orchestrator, commands)
    }

    fn install(orchestrator: &PluginOrchestrator, manifest: PluginManifest, enabled: bool) {
        orchestrator
            .registry()
            .install(
                manifest,
                InstallOptions {
                    enabled: Some(enabled),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn in_memory_registry_registers_and_unregisters() {
        let registry = InMemoryCommandRegistry::new();
        let ran = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&ran);
        let registration = registry.register(HostCommand {
            id: "x".into(),
            label: HostCommandLabel {
                title: "X".into(),
                sub_title: None,
            },
            icon: None,
            category: "test".into(),
            run: Arc::new(move || *counter.lock().unwrap() += 1),
        });
        assert!(registry.run("x"));
        assert_eq!(*ran.lock().unwrap(), 1);
        registration.unregister();
        assert!(!registry.run("x"));
    }

    #[tokio::test]
    async fn bridges_commands_of_enabled_plugins_only() {
        let (orchestrator, commands) = setup();
        install(&orchestrator, manifest("a", &["a.one"]), true);
        install(&orchestrator, manifest("b", &["b.one"]), false);

        orchestrator.sync().await;
        assert_eq!(commands.ids(), vec!["a.one".to_string()]);
        let command = commands.get("a.one").unwrap();
        assert_eq!(command.label.title, "Run a.one");
        assert_eq!(command.category, "Plugin a");
    }

    #[tokio::test]
    async fn first_writer_wins_on_collision() {
        let (orchestrator, commands) = setup();
        install(&orchestrator, manifest("a", &["shared"]), true);
        install(&orchestrator, manifest("b", &["shared", "b.own"]), true);

        orchestrator.sync().await;
        assert_eq!(commands.ids(), vec!["b.own".to_string(), "shared".to_string()]);
        assert_eq!(commands.get("shared").unwrap().category, "Plugin a");

        // Once the first owner leaves, the next contributor takes over.
        orchestrator.registry().set_enabled("a", false).unwrap();
        orchestrator.sync().await;
        assert_eq!(commands.get("shared").unwrap().category, "Plugin b");
    }

    #[tokio::test]
    async fn retracts_commands_on_disable_uninstall_and_update() {
        let (orchestrator, commands) = setup();
        install(&orchestrator, manifest("a", &["a.one", "a.two"]), true);
        orchestrator.sync().await;
        assert_eq!(commands.ids().len(), 2);

        install(&orchestrator, manifest("a", &["a.one"]), true);
        orchestrator.sync().await;
        assert_eq!(commands.ids(), vec!["a.one".to_string()]);

        orchestrator.registry().set_enabled("a", false).unwrap();
        orchestrator.sync().await;
        assert!(commands.ids().is_empty());

        orchestrator.registry().set_enabled("a", true).unwrap();
        orchestrator.sync().await;
        orchestrator.registry().uninstall("a").unwrap();
        orchestrator.sync().await;
        assert!(commands.ids().is_empty());
    }

    #[tokio::test]
    async fn toolbar_commands_are_bridged_with_toolbar_title() {
        let (orchestrator, commands) = setup();
        let mut m = manifest("a", &[]);
        m.contributes.toolbar.push(ToolbarContribution {
            id: "button".into(),
            title: Some("Press".into()),
            icon: Some("star".into()),
            command: Some("a.press".into()),
        });
        install(&orchestrator, m, true);

        orchestrator.sync().await;
        let command = commands.get("a.press").unwrap();
        assert_eq!(command.label.title, "Press");
        assert_eq!(command.icon.as_deref(), Some("star"));
    }

    #[tokio::test]
    async fn icon_and_category_changes_reregister_the_command() {
        let (orchestrator, commands) = setup();
        install(&orchestrator, manifest("a", &["a.one"]), true);
        orchestrator.sync().await;
        assert_eq!(commands.get("a.one").unwrap().icon, None);

        let mut next = manifest("a", &["a.one"]);
        next.contributes.command[0].icon = Some("bolt".into());
        install(&orchestrator, next.clone(), true);
        orchestrator.sync().await;
        assert_eq!(commands.get("a.one").unwrap().icon.as_deref(), Some("bolt"));

        next.name = "Renamed".into();
        install(&orchestrator, next, true);
        orchestrator.sync().await;
        let command = commands.get("a.one").unwrap();
        assert_eq!(command.category, "Renamed");
        assert_eq!(command.icon.as_deref(), Some("bolt"));
        assert_eq!(commands.ids(), vec!["a.one".to_string()]);
    }

    #[tokio::test]
    async fn failed_start_is_not_tracked() {
        let (orchestrator, commands) = setup();
        install(&orchestrator, manifest("a", &["a.one"]), true);

        orchestrator.sync().await;
        assert!(orchestrator.running_ids().is_empty());
        assert!(!orchestrator.execute_command("a.one"));
        // The bridged callback routes to nothing without panicking.
        assert!(commands.run("a.one"));
    }

    #[tokio::test]
    async fn shutdown_retracts_everything() {
        let (orchestrator, commands) = setup();
        install(&orchestrator, manifest("a", &["a.one"]), true);
        orchestrator.sync().await;
        orchestrator.shutdown().await;
        assert!(commands.ids().is_empty());
    }

    #[tokio::test]
    async fn host_call_requires_a_running_plugin() {
        let (orchestrator, _) = setup();
        install(&orchestrator, manifest("off", &[]), false);
        // Enabled, but without an entry it never starts.
        install(&orchestrator, manifest("broken", &[]), true);
        orchestrator.sync().await;

        for plugin_id in ["off", "broken", "ghost"] {
            let err = orchestrator
                .host_call(plugin_id, "ui.showToast", serde_json::json!(["hi"]))
                .await
                .unwrap_err();
            assert!(
                matches!(err, PluginHostError::PluginNotFound(ref id) if id == plugin_id),
                "{plugin_id}: {err}"
            );
        }
    }
}
