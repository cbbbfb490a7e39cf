#![allow(dead_code)]

use canopy_package::{Capability, CommandContribution, EntrySource, PluginManifest};
use canopy_plugin_host::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── WAT guests ─────────────────────────────────────────────────

/// Strings placed in guest memory, with the operands to reach them.
pub struct Layout {
    data: String,
    next: usize,
}

impl Layout {
    /// `(i32.const offset) (i32.const len)` for `text`.
    pub fn text(&mut self, text: &str) -> String {
        let offset = self.next;
        let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
        self.data
            .push_str(&format!("  (data (i32.const {offset}) \"{escaped}\")\n"));
        self.next += text.len();
        format!("(i32.const {offset}) (i32.const {})", text.len())
    }

    /// Expression calling `method` with a JSON argument array; yields the status.
    pub fn call(&mut self, method: &str, args: &str) -> String {
        let method = self.text(method);
        let args = self.text(args);
        format!("(call $call {method} {args})")
    }

    /// Statement calling `method` and discarding the status.
    pub fn call_drop(&mut self, method: &str, args: &str) -> String {
        format!("(drop {})", self.call(method, args))
    }

    pub fn log(&mut self, line: &str) -> String {
        format!("(call $log {})", self.text(line))
    }
}

/// Builds a guest module importing the full `canopy` ABI.
pub struct WatPlugin {
    layout: Layout,
    activate: String,
    deactivate: Option<String>,
    invoke: Option<String>,
    activate_export: &'static str,
}

/// Scratch address for `result_read`.
pub const RESULT_BUF: u32 = 2048;

impl WatPlugin {
    pub fn new() -> Self {
        Self {
            layout: Layout {
                data: String::new(),
                next: 16,
            },
            activate: String::new(),
            deactivate: None,
            invoke: None,
            activate_export: "activate",
        }
    }

    pub fn on_activate(mut self, body: impl FnOnce(&mut Layout) -> String) -> Self {
        self.activate = body(&mut self.layout);
        self
    }

    /// Exports the activation function as `_start` instead of `activate`.
    pub fn start_convention(mut self) -> Self {
        self.activate_export = "_start";
        self
    }

    pub fn on_deactivate(mut self, body: impl FnOnce(&mut Layout) -> String) -> Self {
        self.deactivate = Some(body(&mut self.layout));
        self
    }

    pub fn on_invoke(mut self, body: impl FnOnce(&mut Layout) -> String) -> Self {
        self.invoke = Some(body(&mut self.layout));
        self
    }

    pub fn build(self) -> String {
        let mut wat = String::from(
            r#"(module
  (import "canopy" "call" (func $call (param i32 i32 i32 i32) (result i32)))
  (import "canopy" "result_len" (func $result_len (result i32)))
  (import "canopy" "result_read" (func $result_read (param i32)))
  (import "canopy" "log" (func $log (param i32 i32)))
  (memory (export "memory") 1)
"#,
        );
        wat.push_str(&self.layout.data);
        wat.push_str(&format!(
            "  (func (export \"{}\")\n    {})\n",
            self.activate_export, self.activate
        ));
        if let Some(body) = self.deactivate {
            wat.push_str(&format!("  (func (export \"deactivate\")\n    {body})\n"));
        }
        if let Some(body) = self.invoke {
            wat.push_str("  (func (export \"alloc\") (param i32) (result i32) (i32.const 4096))\n");
            wat.push_str(&format!(
                "  (func (export \"invoke\") (param i32 i32)\n    {body})\n"
            ));
        }
        wat.push_str(")\n");
        wat
    }
}

// ── Collaborators ──────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn toasts(&self) -> Vec<(String, String)> {
        self.toasts.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.toasts().into_iter().map(|(_, m)| m).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn show_toast(&self, plugin_id: &str, message: &str) {
        self.toasts
            .lock()
            .unwrap()
            .push((plugin_id.to_string(), message.to_string()));
    }
}

pub struct FakeDocument(pub Result<Vec<u8>, String>);

impl CrdtDocument for FakeDocument {
    fn encode_state_as_update(&self) -> anyhow::Result<Vec<u8>> {
        self.0.clone().map_err(anyhow::Error::msg)
    }
}

#[derive(Default)]
pub struct FakeDocs {
    pub active: Option<String>,
    pub docs: Vec<(String, Option<String>, Arc<FakeDocument>)>,
}

impl DocAccessor for FakeDocs {
    fn active_doc_id(&self) -> Option<String> {
        self.active.clone()
    }

    fn document(&self, doc_id: &str) -> Option<Arc<dyn CrdtDocument>> {
        self.docs
            .iter()
            .find(|(id, _, _)| id == doc_id)
            .map(|(_, _, doc)| Arc::clone(doc) as Arc<dyn CrdtDocument>)
    }

    fn doc_title(&self, doc_id: &str) -> Option<String> {
        self.docs
            .iter()
            .find(|(id, _, _)| id == doc_id)
            .and_then(|(_, title, _)| title.clone())
    }
}

// ── Host setup ─────────────────────────────────────────────────

pub struct TestHost {
    pub orchestrator: PluginOrchestrator,
    pub registry: Arc<RegistryStore>,
    pub host_api: Arc<HostApi>,
    pub notifier: Arc<RecordingNotifier>,
    pub commands: InMemoryCommandRegistry,
}

/// Small limits so runaway guests fail fast.
pub fn test_limits() -> ResourceLimits {
    ResourceLimits {
        max_memory_bytes: 1024 * 1024,
        fuel_per_call: 5_000_000,
        stop_grace_ms: 500,
    }
}

pub fn test_host() -> TestHost {
    test_host_with(test_limits())
}

pub fn test_host_with(limits: ResourceLimits) -> TestHost {
    let registry = Arc::new(RegistryStore::in_memory());
    let notifier = Arc::new(RecordingNotifier::default());
    let host_api = Arc::new(
        HostApi::new(Arc::new(PluginStorage::in_memory()))
            .with_notifier(Arc::clone(&notifier) as Arc<dyn Notifier>),
    );
    let commands = InMemoryCommandRegistry::new();
    let orchestrator = PluginOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&host_api),
        Arc::new(commands.clone()),
        limits,
    );
    TestHost {
        orchestrator,
        registry,
        host_api,
        notifier,
        commands,
    }
}

pub fn manifest(id: &str, permissions: &[Capability]) -> PluginManifest {
    let mut manifest = PluginManifest::new(id, format!("Plugin {id}"), "1.0.0", "main.wat");
    manifest.permissions = permissions.to_vec();
    manifest
}

pub fn with_command(mut manifest: PluginManifest, command_id: &str) -> PluginManifest {
    manifest.contributes.command.push(CommandContribution {
        id: command_id.to_string(),
        title: Some(format!("Run {command_id}")),
        icon: None,
        command: None,
    });
    manifest
}

impl TestHost {
    pub fn install(&self, manifest: PluginManifest, entry: &str, enabled: bool) -> PluginRecord {
        self.registry
            .install(
                manifest,
                InstallOptions {
                    enabled: Some(enabled),
                    entry_source: Some(EntrySource::Text(entry.to_string())),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    pub fn stored(&self, plugin_id: &str, key: &str) -> Option<serde_json::Value> {
        self.host_api.storage().get(plugin_id, key).unwrap()
    }

    /// Polls plugin storage until `key` appears (commands run asynchronously).
    pub async fn wait_for_key(&self, plugin_id: &str, key: &str) -> Option<serde_json::Value> {
        for _ in 0..100 {
            if let Some(value) = self.stored(plugin_id, key) {
                return Some(value);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    pub async fn wait_for_toasts(&self, count: usize) -> Vec<String> {
        for _ in 0..100 {
            let messages = self.notifier.messages();
            if messages.len() >= count {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.notifier.messages()
    }
}

/// Minimal guest that activates and does nothing else.
pub fn noop_plugin() -> String {
    WatPlugin::new().build()
}
