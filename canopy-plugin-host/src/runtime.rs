//! Host side of a plugin sandbox.
//!
//! A [`SandboxRuntime`] owns the sandbox thread for one plugin record and
//! the message pump that answers its host calls. State machine:
//!
//! ```text
//! Idle -> Starting -> Ready -> Stopping -> Stopped
//! ```
//!
//! `Stopped` is terminal; a stopped runtime is replaced, never restarted.

use canopy_package::EntrySource;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wasmtime::Engine;

use crate::error::PluginHostError;
use crate::host_api::{CallContext, HostApi};
use crate::permissions::PermissionSet;
use crate::protocol::{HostMessage, SandboxMessage};
use crate::registry::PluginRecord;
use crate::sandbox::{GuestChannels, ResourceLimits, run_guest, sandbox_engine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
}

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), String>>>>>;

/// Live connection to a sandbox thread.
struct Channel {
    tx: UnboundedSender<HostMessage>,
    engine: Engine,
    pump: JoinHandle<()>,
}

impl Channel {
    /// Interrupts running guest code and closes the host side.
    fn terminate(self) {
        self.engine.increment_epoch();
        self.pump.abort();
    }
}

/// Isolated execution unit for one plugin.
pub struct SandboxRuntime {
    plugin_id: String,
    permissions: PermissionSet,
    entry: Option<EntrySource>,
    limits: ResourceLimits,
    host_api: Arc<HostApi>,
    state: Mutex<SandboxState>,
    channel: Mutex<Option<Channel>>,
    waiters: Waiters,
    next_id: AtomicU64,
    /// Serializes `start` and `stop`.
    lifecycle: tokio::sync::Mutex<()>,
}

impl SandboxRuntime {
    pub fn new(record: &PluginRecord, host_api: Arc<HostApi>, limits: ResourceLimits) -> Self {
        Self {
            plugin_id: record.id().to_string(),
            permissions: record.permissions(),
            entry: record.entry_source.clone(),
            limits,
            host_api,
            state: Mutex::new(SandboxState::Idle),
            channel: Mutex::new(None),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn state(&self) -> SandboxState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SandboxState::Stopped)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SandboxState::Ready
    }

    fn set_state(&self, next: SandboxState) {
        if let Ok(mut state) = self.state.lock() {
            debug!(plugin_id = %self.plugin_id, from = ?*state, to = ?next, "Sandbox state change");
            *state = next;
        }
    }

    fn take_channel(&self) -> Option<Channel> {
        self.channel.lock().ok().and_then(|mut c| c.take())
    }

    fn register_waiter(&self) -> (u64, oneshot::Receiver<Result<(), String>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.insert(id, tx);
        }
        (id, rx)
    }

    /// Spawns the sandbox thread, loads the entry and runs its activation.
    /// Returns once the plugin reported ready. Calling it on a ready runtime
    /// is a no-op.
    pub async fn start(&self) -> Result<(), PluginHostError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            SandboxState::Ready => return Ok(()),
            SandboxState::Stopping | SandboxState::Stopped => {
                return Err(PluginHostError::SandboxStopped(self.plugin_id.clone()));
            }
            SandboxState::Idle | SandboxState::Starting => {}
        }

        let entry = self.entry.clone().ok_or_else(|| PluginHostError::SandboxExecution {
            plugin_id: self.plugin_id.clone(),
            message: "record has no entry source".into(),
        })?;

        self.set_state(SandboxState::Starting);
        info!(plugin_id = %self.plugin_id, entry_bytes = entry.len(), "Starting plugin sandbox");

        let engine = sandbox_engine()?;
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (sandbox_tx, sandbox_rx) = mpsc::unbounded_channel();

        let thread_engine = engine.clone();
        let plugin_id = self.plugin_id.clone();
        let limits = self.limits.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("canopy-plugin-{}", self.plugin_id))
            .spawn(move || {
                run_guest(
                    plugin_id,
                    thread_engine,
                    limits,
                    GuestChannels {
                        inbound: host_rx,
                        outbound: sandbox_tx,
                    },
                )
            });
        if let Err(e) = spawned {
            self.set_state(SandboxState::Stopped);
            return Err(PluginHostError::SandboxExecution {
                plugin_id: self.plugin_id.clone(),
                message: format!("failed to spawn sandbox thread: {e}"),
            });
        }

        let ctx = CallContext::new(self.plugin_id.clone(), self.permissions.clone())
            .with_invoker(&host_tx);
        let pump = tokio::spawn(pump(
            sandbox_rx,
            self.waiters.clone(),
            self.host_api.clone(),
            ctx,
        ));

        let (init_id, ready) = self.register_waiter();
        let _ = host_tx.send(HostMessage::Init { id: init_id, entry });
        if let Ok(mut channel) = self.channel.lock() {
            *channel = Some(Channel {
                tx: host_tx,
                engine,
                pump,
            });
        }

        let failure = match ready.await {
            Ok(Ok(())) => {
                self.set_state(SandboxState::Ready);
                info!(plugin_id = %self.plugin_id, "Plugin sandbox ready");
                return Ok(());
            }
            Ok(Err(message)) => message,
            Err(_) => "sandbox exited during activation".to_string(),
        };

        if let Some(channel) = self.take_channel() {
            channel.terminate();
        }
        self.set_state(SandboxState::Stopped);
        Err(PluginHostError::SandboxExecution {
            plugin_id: self.plugin_id.clone(),
            message: failure,
        })
    }

    /// Asks the plugin to deactivate, then tears the sandbox down. Guest code
    /// still running after the grace period is interrupted. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == SandboxState::Stopped {
            return;
        }
        self.set_state(SandboxState::Stopping);

        if let Some(channel) = self.take_channel() {
            let (stop_id, stopped) = self.register_waiter();
            if channel.tx.send(HostMessage::Stop { id: stop_id }).is_ok() {
                match tokio::time::timeout(self.limits.stop_grace(), stopped).await {
                    Ok(Ok(_)) => debug!(plugin_id = %self.plugin_id, "Plugin deactivated"),
                    Ok(Err(_)) => debug!(plugin_id = %self.plugin_id, "Sandbox exited before confirming stop"),
                    Err(_) => warn!(
                        plugin_id = %self.plugin_id,
                        grace_ms = self.limits.stop_grace_ms,
                        "Plugin did not stop within grace period, terminating"
                    ),
                }
            }
            channel.terminate();
        }
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.clear();
        }

        self.set_state(SandboxState::Stopped);
        info!(plugin_id = %self.plugin_id, "Plugin sandbox stopped");
    }

    /// Dispatches a command into the guest's handler. Fire-and-forget:
    /// returns whether the message was delivered to a ready sandbox.
    pub fn invoke(&self, command_id: &str) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.channel
            .lock()
            .ok()
            .and_then(|channel| {
                channel.as_ref().map(|c| {
                    c.tx.send(HostMessage::Invoke {
                        command_id: command_id.to_string(),
                    })
                    .is_ok()
                })
            })
            .unwrap_or(false)
    }
}

impl Drop for SandboxRuntime {
    fn drop(&mut self) {
        if let Some(channel) = self.take_channel() {
            channel.terminate();
        }
    }
}

/// Routes sandbox messages: lifecycle replies resolve waiters, calls are
/// dispatched on their own task so results may complete out of order.
async fn pump(
    mut rx: UnboundedReceiver<SandboxMessage>,
    waiters: Waiters,
    host_api: Arc<HostApi>,
    ctx: CallContext,
) {
    let resolve = |id: u64, outcome: Result<(), String>| {
        let waiter = waiters.lock().ok().and_then(|mut w| w.remove(&id));
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(plugin_id = %ctx.plugin_id, id, "No waiter for sandbox reply"),
        }
    };

    while let Some(message) = rx.recv().await {
        match message {
            SandboxMessage::Ready { id } | SandboxMessage::Stopped { id } => resolve(id, Ok(())),
            SandboxMessage::Error { id, message } => {
                warn!(plugin_id = %ctx.plugin_id, error = %message, "Plugin sandbox error");
                resolve(id, Err(message));
            }
            SandboxMessage::Call {
                request_id,
                method,
                args,
            } => {
                let host_api = host_api.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let reply = host_api
                        .dispatch_host_call(&ctx, request_id, &method, args)
                        .await;
                    if let Some(tx) = ctx.invoker.as_ref().and_then(|w| w.upgrade()) {
                        let _ = tx.send(reply);
                    }
                });
            }
        }
    }
    // Fails any start/stop still waiting on this sandbox.
    if let Ok(mut waiters) = waiters.lock() {
        waiters.clear();
    }
    debug!(plugin_id = %ctx.plugin_id, "Sandbox channel closed");
}
