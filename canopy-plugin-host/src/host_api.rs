//! Host API surface answering sandbox `call` requests.
//!
//! Each call is handled in four steps: the method name is parsed into a
//! [`HostMethod`], the plugin's permissions are checked, the positional
//! arguments are decoded into a [`HostRequest`], and the request is executed.
//! Nothing observable happens before the permission check passes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedSender, WeakUnboundedSender};
use tracing::{debug, info, warn};

use crate::error::PluginHostError;
use crate::permissions::{HostMethod, PermissionSet, check_permission};
use crate::protocol::HostMessage;
use crate::storage::PluginStorage;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Surface for user-visible notifications.
pub trait Notifier: Send + Sync {
    fn show_toast(&self, plugin_id: &str, message: &str);
}

/// Writes toasts to the log. Used when the host has no notification UI.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn show_toast(&self, plugin_id: &str, message: &str) {
        info!(plugin_id = %plugin_id, "[toast] {message}");
    }
}

/// A collaborative document as exposed by the host editor.
pub trait CrdtDocument: Send + Sync {
    /// Full document state as a single update blob.
    fn encode_state_as_update(&self) -> anyhow::Result<Vec<u8>>;
}

/// Read-only access to the host's open documents.
pub trait DocAccessor: Send + Sync {
    fn active_doc_id(&self) -> Option<String>;
    fn document(&self, doc_id: &str) -> Option<Arc<dyn CrdtDocument>>;
    fn doc_title(&self, doc_id: &str) -> Option<String>;
}

/// Identity of the plugin a call originates from.
#[derive(Clone)]
pub struct CallContext {
    pub plugin_id: String,
    pub permissions: PermissionSet,
    /// Channel back into the caller's own sandbox. Weak, so an idle call
    /// context never keeps a sandbox alive.
    pub invoker: Option<WeakUnboundedSender<HostMessage>>,
}

impl CallContext {
    pub fn new(plugin_id: impl Into<String>, permissions: PermissionSet) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            permissions,
            invoker: None,
        }
    }

    pub fn with_invoker(mut self, invoker: &UnboundedSender<HostMessage>) -> Self {
        self.invoker = Some(invoker.downgrade());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandSpec {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotOptions {
    #[serde(default)]
    pub doc_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FetchOptions {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// A decoded host call. One variant per [`HostMethod`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    ShowToast { message: String },
    RegisterCommand(CommandSpec),
    ExecuteCommand { id: String },
    StorageGet { key: String },
    StorageSet { key: String, value: Value },
    StorageRemove { key: String },
    DocSnapshot(SnapshotOptions),
    Fetch { url: String, options: FetchOptions },
}

impl HostRequest {
    /// Decodes the positional argument array for `method`.
    pub fn decode(method: HostMethod, args: Value) -> Result<Self, PluginHostError> {
        let args = Args::new(method, args)?;
        Ok(match method {
            HostMethod::ShowToast => Self::ShowToast {
                message: args.required(0, "message")?,
            },
            HostMethod::RegisterCommand => {
                let spec: CommandSpec = args.required(0, "command")?;
                if spec.id.trim().is_empty() {
                    return Err(args.invalid("command id must not be empty"));
                }
                Self::RegisterCommand(spec)
            }
            HostMethod::ExecuteCommand => Self::ExecuteCommand {
                id: args.required(0, "id")?,
            },
            HostMethod::StorageGet => Self::StorageGet {
                key: args.required(0, "key")?,
            },
            HostMethod::StorageSet => Self::StorageSet {
                key: args.required(0, "key")?,
                value: args.optional(1)?.unwrap_or(Value::Null),
            },
            HostMethod::StorageRemove => Self::StorageRemove {
                key: args.required(0, "key")?,
            },
            HostMethod::DocSnapshot => Self::DocSnapshot(args.optional(0)?.unwrap_or_default()),
            HostMethod::Fetch => Self::Fetch {
                url: args.required(0, "url")?,
                options: args.optional(1)?.unwrap_or_default(),
            },
        })
    }
}

struct Args {
    method: HostMethod,
    values: Vec<Value>,
}

impl Args {
    fn new(method: HostMethod, args: Value) -> Result<Self, PluginHostError> {
        let values = match args {
            Value::Array(values) => values,
            Value::Null => Vec::new(),
            other => {
                return Err(PluginHostError::InvalidArguments {
                    method: method.name().to_string(),
                    message: format!("expected an argument array, got {other}"),
                });
            }
        };
        Ok(Self { method, values })
    }

    fn required<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, PluginHostError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Err(self.invalid(&format!("missing argument `{name}`"))),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| self.invalid(&format!("argument `{name}`: {e}"))),
        }
    }

    fn optional<T: DeserializeOwned>(&self, index: usize) -> Result<Option<T>, PluginHostError> {
        match self.values.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| self.invalid(&format!("argument {index}: {e}"))),
        }
    }

    fn invalid(&self, message: &str) -> PluginHostError {
        PluginHostError::InvalidArguments {
            method: self.method.name().to_string(),
            message: message.to_string(),
        }
    }
}

/// Dispatcher for host calls, shared by every sandbox of one host.
pub struct HostApi {
    storage: Arc<PluginStorage>,
    notifier: Arc<dyn Notifier>,
    docs: Option<Arc<dyn DocAccessor>>,
    http: reqwest::Client,
    /// plugin id -> command id -> title
    commands: Mutex<HashMap<String, BTreeMap<String, Option<String>>>>,
}

impl HostApi {
    pub fn new(storage: Arc<PluginStorage>) -> Self {
        Self {
            storage,
            notifier: Arc::new(TracingNotifier),
            docs: None,
            http: reqwest::Client::new(),
            commands: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_doc_accessor(mut self, docs: Arc<dyn DocAccessor>) -> Self {
        self.docs = Some(docs);
        self
    }

    pub fn storage(&self) -> &Arc<PluginStorage> {
        &self.storage
    }

    /// Command ids the plugin registered at runtime, sorted.
    pub fn registered_commands(&self, plugin_id: &str) -> Vec<String> {
        self.commands
            .lock()
            .map(|commands| {
                commands
                    .get(plugin_id)
                    .map(|ids| ids.keys().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Drops runtime state held for a plugin whose sandbox went away.
    pub fn forget_plugin(&self, plugin_id: &str) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.remove(plugin_id);
        }
    }

    /// Handles one call and wraps the outcome in the `Result` reply.
    pub async fn dispatch_host_call(
        &self,
        ctx: &CallContext,
        request_id: u64,
        method: &str,
        args: Value,
    ) -> HostMessage {
        HostMessage::call_result(request_id, self.dispatch(ctx, method, args).await)
    }

    /// Parses, authorizes, decodes and executes one host call.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        method: &str,
        args: Value,
    ) -> Result<Value, PluginHostError> {
        let method = check_permission(&ctx.plugin_id, &ctx.permissions, method).inspect_err(|e| {
            warn!(plugin_id = %ctx.plugin_id, method, error = %e, "Host call denied");
        })?;
        let request = HostRequest::decode(method, args)?;
        debug!(plugin_id = %ctx.plugin_id, %method, "Host call");
        self.execute(ctx, request).await
    }

    async fn execute(&self, ctx: &CallContext, request: HostRequest) -> Result<Value, PluginHostError> {
        let plugin_id = ctx.plugin_id.as_str();
        match request {
            HostRequest::ShowToast { message } => {
                self.notifier.show_toast(plugin_id, &message);
                Ok(Value::Null)
            }
            HostRequest::RegisterCommand(spec) => {
                let mut commands = self
                    .commands
                    .lock()
                    .map_err(|_| PluginHostError::Storage("command table poisoned".into()))?;
                debug!(plugin_id = %plugin_id, command_id = %spec.id, "Command registered");
                commands
                    .entry(plugin_id.to_string())
                    .or_default()
                    .insert(spec.id, spec.title);
                Ok(Value::Null)
            }
            HostRequest::ExecuteCommand { id } => {
                let delivered = ctx
                    .invoker
                    .as_ref()
                    .and_then(WeakUnboundedSender::upgrade)
                    .is_some_and(|tx| tx.send(HostMessage::Invoke { command_id: id }).is_ok());
                Ok(Value::Bool(delivered))
            }
            HostRequest::StorageGet { key } => {
                Ok(self.storage.get(plugin_id, &key)?.unwrap_or(Value::Null))
            }
            HostRequest::StorageSet { key, value } => {
                self.storage.set(plugin_id, &key, &value)?;
                Ok(Value::Null)
            }
            HostRequest::StorageRemove { key } => {
                self.storage.remove(plugin_id, &key)?;
                Ok(Value::Null)
            }
            HostRequest::DocSnapshot(options) => Ok(self.doc_snapshot(plugin_id, options)),
            HostRequest::Fetch { url, options } => self.fetch(plugin_id, &url, options).await,
        }
    }

    fn doc_snapshot(&self, plugin_id: &str, options: SnapshotOptions) -> Value {
        let Some(docs) = &self.docs else {
            return Value::Null;
        };
        let Some(doc_id) = options.doc_id.or_else(|| docs.active_doc_id()) else {
            return Value::Null;
        };
        let Some(document) = docs.document(&doc_id) else {
            return Value::Null;
        };
        let update = match document.encode_state_as_update() {
            Ok(update) => update,
            Err(e) => {
                warn!(plugin_id = %plugin_id, doc_id = %doc_id, error = %e, "Failed to encode document snapshot");
                return Value::Null;
            }
        };

        let mut snapshot = json!({
            "docId": doc_id,
            "snapshot": BASE64.encode(&update),
            "size": update.len(),
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        if let Some(title) = docs.doc_title(&doc_id) {
            snapshot["title"] = Value::String(title);
        }
        snapshot
    }

    async fn fetch(
        &self,
        plugin_id: &str,
        url: &str,
        options: FetchOptions,
    ) -> Result<Value, PluginHostError> {
        let invalid = |message: String| PluginHostError::InvalidArguments {
            method: HostMethod::Fetch.name().to_string(),
            message,
        };

        let parsed = reqwest::Url::parse(url).map_err(|e| invalid(format!("invalid url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported url scheme '{}'", parsed.scheme())));
        }
        let method = options.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| invalid(format!("invalid http method '{method}'")))?;

        info!(plugin_id = %plugin_id, %method, url = %parsed, "Plugin fetch");

        let mut request = self.http.request(method, parsed).timeout(FETCH_TIMEOUT);
        for (name, value) in &options.headers {
            request = request.header(name, value);
        }
        if let Some(body) = options.body {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PluginHostError::Network(e.to_string()))?;
        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| PluginHostError::Network(e.to_string()))?;

        Ok(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "headers": headers,
            "body": body,
        }))
    }
}
