//! Guest side of a plugin sandbox: one Wasmtime instance on its own thread.
//!
//! The thread owns the `wasmtime::Store` with:
//! - Memory isolation (configurable ceiling via [`TrackingLimiter`])
//! - CPU fuel budgets per guest entry (prevents infinite loops)
//! - Epoch interruption, so the host can terminate running guest code
//! - An import table holding only the `canopy` module below
//!
//! Guest ABI (`canopy` import module):
//! - `call(method_ptr, method_len, args_ptr, args_len) -> i32`: sends a host
//!   call (args are a JSON array) and blocks until its result arrives.
//!   Returns 0 on success and 1 on failure.
//! - `result_len() -> i32` / `result_read(dst_ptr)`: fetch the payload of the
//!   last call (JSON result on success, error text on failure).
//! - `log(ptr, len)`: write a line to the plugin console.
//!
//! Guest exports: `memory`, `activate` (or `_start`), and optionally
//! `deactivate` and the command handler pair `alloc(len) -> ptr` +
//! `invoke(ptr, len)`, which receives the command id as UTF-8.

use canopy_package::EntrySource;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use wasmtime::{Caller, Engine, Extern, Instance, Linker, Memory, Module, ResourceLimiter, Store};

use crate::protocol::{HostMessage, SandboxMessage};

const IMPORT_MODULE: &str = "canopy";

/// Resource limits for a plugin sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum linear memory in bytes.
    pub max_memory_bytes: usize,
    /// CPU fuel budget per guest entry (activate, invoke, deactivate).
    pub fuel_per_call: u64,
    /// How long `stop()` waits for `deactivate` before forcing termination.
    pub stop_grace_ms: u64,
}

impl ResourceLimits {
    pub fn builtin() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            fuel_per_call: 1_000_000_000,
            stop_grace_ms: 2_000,
        }
    }

    pub fn local() -> Self {
        Self {
            max_memory_bytes: 32 * 1024 * 1024,
            fuel_per_call: 500_000_000,
            stop_grace_ms: 2_000,
        }
    }

    pub fn stop_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::local()
    }
}

/// A resource limiter that tracks the guest's memory size.
pub struct TrackingLimiter {
    max_memory: usize,
    current_memory: usize,
    max_table_elements: usize,
}

impl TrackingLimiter {
    pub fn new(max_memory: usize) -> Self {
        Self {
            max_memory,
            current_memory: 0,
            max_table_elements: 20_000,
        }
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.current_memory
    }
}

impl ResourceLimiter for TrackingLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        if desired <= self.max_memory {
            self.current_memory = desired;
            Ok(true)
        } else {
            debug!(
                current,
                desired,
                max = self.max_memory,
                "Memory growth denied - would exceed limit"
            );
            Ok(false)
        }
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        Ok(desired <= self.max_table_elements)
    }
}

/// Builds the engine for one sandbox. The host keeps a clone to bump the
/// epoch when it needs to interrupt the guest.
pub fn sandbox_engine() -> wasmtime::Result<Engine> {
    let mut config = wasmtime::Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    Engine::new(&config)
}

struct CallOutcome {
    ok: bool,
    payload: Vec<u8>,
}

/// Data stored in the guest's `wasmtime::Store`.
struct GuestState {
    plugin_id: String,
    inbound: UnboundedReceiver<HostMessage>,
    outbound: UnboundedSender<SandboxMessage>,
    next_request_id: u64,
    /// In-flight calls; `None` until the matching result arrives.
    pending: HashMap<u64, Option<CallOutcome>>,
    /// Invokes that arrived while the guest was suspended in a call.
    deferred: VecDeque<String>,
    /// Set when a `Stop` arrived while the guest was suspended in a call.
    /// The current entry finishes first; the host enforces the grace period.
    stop_requested: Option<u64>,
    last_payload: Vec<u8>,
    limiter: TrackingLimiter,
}

impl GuestState {
    /// Sends one call and blocks until its result arrives. Invokes received
    /// in the meantime are queued, a `Stop` is recorded for the main loop.
    /// Only a closed host channel aborts the call.
    fn round_trip(&mut self, method: String, args: Value) -> wasmtime::Result<i32> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.pending.insert(request_id, None);

        if self
            .outbound
            .send(SandboxMessage::Call {
                request_id,
                method,
                args,
            })
            .is_err()
        {
            self.reject_pending("host channel closed");
            return Err(wasmtime::Error::msg("host channel closed"));
        }

        loop {
            if let Some(Some(_)) = self.pending.get(&request_id) {
                break;
            }
            match self.inbound.blocking_recv() {
                Some(HostMessage::Result {
                    request_id: id,
                    ok,
                    result,
                    error,
                }) => match self.pending.get_mut(&id) {
                    Some(slot) => {
                        let payload = if ok {
                            serde_json::to_vec(&result.unwrap_or(Value::Null)).unwrap_or_default()
                        } else {
                            error.unwrap_or_default().into_bytes()
                        };
                        *slot = Some(CallOutcome { ok, payload });
                    }
                    None => debug!(plugin_id = %self.plugin_id, request_id = id, "Dropping result for unknown call"),
                },
                Some(HostMessage::Invoke { command_id }) => {
                    if self.stop_requested.is_some() {
                        debug!(plugin_id = %self.plugin_id, command_id = %command_id, "Dropping invoke after stop");
                    } else {
                        self.deferred.push_back(command_id);
                    }
                }
                Some(HostMessage::Stop { id }) => {
                    debug!(plugin_id = %self.plugin_id, request_id, "Stop requested during host call");
                    self.stop_requested = Some(id);
                }
                Some(HostMessage::Init { .. }) => {
                    warn!(plugin_id = %self.plugin_id, "Ignoring duplicate init");
                }
                None => {
                    self.reject_pending("host channel closed");
                    return Err(wasmtime::Error::msg("host channel closed"));
                }
            }
        }

        let outcome = self
            .pending
            .remove(&request_id)
            .flatten()
            .ok_or_else(|| wasmtime::Error::msg("call outcome missing"))?;
        self.last_payload = outcome.payload;
        Ok(if outcome.ok { 0 } else { 1 })
    }

    fn reject_pending(&mut self, reason: &str) {
        if !self.pending.is_empty() {
            debug!(
                plugin_id = %self.plugin_id,
                count = self.pending.len(),
                reason,
                "Rejecting pending calls"
            );
            self.pending.clear();
        }
    }

    fn send(&self, message: SandboxMessage) {
        // The host only drops its receiver after it stopped listening.
        let _ = self.outbound.send(message);
    }
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> wasmtime::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| wasmtime::Error::msg("plugin does not export `memory`"))
}

fn read_guest(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> wasmtime::Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let (Ok(start), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(wasmtime::Error::msg("negative pointer or length"));
    };
    memory
        .data(&*caller)
        .get(start..start.saturating_add(len))
        .map(<[u8]>::to_vec)
        .ok_or_else(|| wasmtime::Error::msg("guest memory access out of bounds"))
}

fn read_guest_string(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> wasmtime::Result<String> {
    String::from_utf8(read_guest(caller, ptr, len)?)
        .map_err(|_| wasmtime::Error::msg("guest string is not UTF-8"))
}

fn link_host_imports(linker: &mut Linker<GuestState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "call",
        |mut caller: Caller<'_, GuestState>,
         method_ptr: i32,
         method_len: i32,
         args_ptr: i32,
         args_len: i32|
         -> wasmtime::Result<i32> {
            let method = read_guest_string(&mut caller, method_ptr, method_len)?;
            let raw_args = read_guest(&mut caller, args_ptr, args_len)?;
            let state = caller.data_mut();
            let args: Value = match serde_json::from_slice(&raw_args) {
                Ok(args) => args,
                Err(e) => {
                    state.last_payload = format!("call arguments are not valid JSON: {e}").into_bytes();
                    return Ok(1);
                }
            };
            state.round_trip(method, args)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "result_len",
        |caller: Caller<'_, GuestState>| -> i32 {
            i32::try_from(caller.data().last_payload.len()).unwrap_or(i32::MAX)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "result_read",
        |mut caller: Caller<'_, GuestState>, dst_ptr: i32| -> wasmtime::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let offset = usize::try_from(dst_ptr)
                .map_err(|_| wasmtime::Error::msg("negative destination pointer"))?;
            let payload = std::mem::take(&mut caller.data_mut().last_payload);
            let written = memory.write(&mut caller, offset, &payload);
            caller.data_mut().last_payload = payload;
            written.map_err(|_| wasmtime::Error::msg("guest memory access out of bounds"))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "log",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let line = read_guest_string(&mut caller, ptr, len)?;
            info!(plugin_id = %caller.data().plugin_id, "[plugin] {line}");
            Ok(())
        },
    )?;

    Ok(())
}

/// A compiled and instantiated plugin module.
struct Guest {
    store: Store<GuestState>,
    instance: Instance,
    fuel_per_call: u64,
}

impl Guest {
    fn instantiate(
        engine: &Engine,
        entry: &EntrySource,
        limits: &ResourceLimits,
        state: GuestState,
    ) -> wasmtime::Result<Self> {
        let module = Module::new(engine, entry.as_bytes())?;

        let mut linker = Linker::new(engine);
        link_host_imports(&mut linker)?;

        let mut store = Store::new(engine, state);
        store.limiter(|s| &mut s.limiter);
        store.set_epoch_deadline(1);
        store.set_fuel(limits.fuel_per_call)?;

        let instance = linker.instantiate(&mut store, &module)?;
        Ok(Self {
            store,
            instance,
            fuel_per_call: limits.fuel_per_call,
        })
    }

    fn state(&mut self) -> &mut GuestState {
        self.store.data_mut()
    }

    /// Runs `activate`, falling back to `_start`.
    fn activate(&mut self) -> wasmtime::Result<()> {
        let entry = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "activate")
            .or_else(|_| self.instance.get_typed_func::<(), ()>(&mut self.store, "_start"))
            .map_err(|_| wasmtime::Error::msg("plugin exports neither `activate` nor `_start`"))?;
        self.store.set_fuel(self.fuel_per_call)?;
        entry.call(&mut self.store, ())
    }

    fn deactivate(&mut self) -> wasmtime::Result<()> {
        let Ok(deactivate) = self.instance.get_typed_func::<(), ()>(&mut self.store, "deactivate")
        else {
            return Ok(());
        };
        self.store.set_fuel(self.fuel_per_call)?;
        deactivate.call(&mut self.store, ())
    }

    fn invoke(&mut self, command_id: &str) -> wasmtime::Result<()> {
        let handlers = (
            self.instance.get_typed_func::<i32, i32>(&mut self.store, "alloc"),
            self.instance.get_typed_func::<(i32, i32), ()>(&mut self.store, "invoke"),
            self.instance.get_memory(&mut self.store, "memory"),
        );
        let (Ok(alloc), Ok(invoke), Some(memory)) = handlers else {
            debug!(plugin_id = %self.state().plugin_id, command_id, "Plugin has no command handler");
            return Ok(());
        };

        let len = i32::try_from(command_id.len())
            .map_err(|_| wasmtime::Error::msg("command id too long"))?;
        self.store.set_fuel(self.fuel_per_call)?;
        let ptr = alloc.call(&mut self.store, len)?;
        let offset =
            usize::try_from(ptr).map_err(|_| wasmtime::Error::msg("alloc returned a negative pointer"))?;
        memory
            .write(&mut self.store, offset, command_id.as_bytes())
            .map_err(|_| wasmtime::Error::msg("alloc returned an out-of-bounds pointer"))?;
        invoke.call(&mut self.store, (ptr, len))
    }
}

/// Channels and limits handed to a sandbox thread.
pub(crate) struct GuestChannels {
    pub inbound: UnboundedReceiver<HostMessage>,
    pub outbound: UnboundedSender<SandboxMessage>,
}

/// Body of the sandbox thread. Returns when the plugin stopped or the host
/// went away.
pub(crate) fn run_guest(
    plugin_id: String,
    engine: Engine,
    limits: ResourceLimits,
    channels: GuestChannels,
) {
    let GuestChannels {
        mut inbound,
        outbound,
    } = channels;

    let (init_id, entry) = loop {
        match inbound.blocking_recv() {
            Some(HostMessage::Init { id, entry }) => break (id, entry),
            Some(HostMessage::Stop { id }) => {
                let _ = outbound.send(SandboxMessage::Stopped { id });
                return;
            }
            Some(other) => debug!(plugin_id = %plugin_id, ?other, "Ignoring message before init"),
            None => return,
        }
    };

    let state = GuestState {
        plugin_id: plugin_id.clone(),
        inbound,
        outbound: outbound.clone(),
        next_request_id: 1,
        pending: HashMap::new(),
        deferred: VecDeque::new(),
        stop_requested: None,
        last_payload: Vec::new(),
        limiter: TrackingLimiter::new(limits.max_memory_bytes),
    };

    let mut guest = match Guest::instantiate(&engine, &entry, &limits, state) {
        Ok(guest) => guest,
        Err(e) => {
            let _ = outbound.send(SandboxMessage::Error {
                id: init_id,
                message: format!("failed to load plugin: {e:#}"),
            });
            return;
        }
    };

    if let Err(e) = guest.activate() {
        guest.state().send(SandboxMessage::Error {
            id: init_id,
            message: format!("activation failed: {e:#}"),
        });
        return;
    }
    info!(
        plugin_id = %plugin_id,
        memory_bytes = guest.state().limiter.current_memory_bytes(),
        "Plugin activated"
    );
    guest.state().send(SandboxMessage::Ready { id: init_id });

    loop {
        // Invokes queued before the stop still run, inside the grace period.
        if let Some(command_id) = guest.state().deferred.pop_front() {
            run_command(&mut guest, &command_id);
            continue;
        }
        if let Some(stop_id) = guest.state().stop_requested.take() {
            finish(&mut guest, stop_id);
            return;
        }
        match guest.state().inbound.blocking_recv() {
            Some(HostMessage::Invoke { command_id }) => run_command(&mut guest, &command_id),
            Some(HostMessage::Stop { id }) => {
                finish(&mut guest, id);
                return;
            }
            Some(HostMessage::Result { request_id, .. }) => {
                debug!(plugin_id = %plugin_id, request_id, "Ignoring result with no pending call");
            }
            Some(HostMessage::Init { .. }) => {
                warn!(plugin_id = %plugin_id, "Ignoring duplicate init");
            }
            None => return,
        }
    }
}

/// Runs `deactivate` and confirms the stop.
fn finish(guest: &mut Guest, stop_id: u64) {
    if let Err(e) = guest.deactivate() {
        let plugin_id = guest.state().plugin_id.clone();
        warn!(plugin_id = %plugin_id, error = %e, "Plugin deactivate failed");
    }
    guest.state().send(SandboxMessage::Stopped { id: stop_id });
}

fn run_command(guest: &mut Guest, command_id: &str) {
    if let Err(e) = guest.invoke(command_id) {
        let plugin_id = guest.state().plugin_id.clone();
        warn!(plugin_id = %plugin_id, command_id, error = %e, "Plugin command failed");
    }
}
