//! Messages exchanged between the host and a sandbox thread.
//!
//! Requests carry a correlation id; the reply reuses it. `Call` ids are
//! allocated by the sandbox, `Init`/`Stop` ids by the host.

use canopy_package::EntrySource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PluginHostError;

/// Host → sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostMessage {
    /// Compile, instantiate and activate `entry`.
    Init { id: u64, entry: EntrySource },
    /// Run the guest's command handler. No reply.
    #[serde(rename_all = "camelCase")]
    Invoke { command_id: String },
    /// Deactivate and shut down.
    Stop { id: u64 },
    /// Outcome of a sandbox-originated `Call`.
    #[serde(rename_all = "camelCase")]
    Result {
        request_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HostMessage {
    /// Builds the `Result` reply for one dispatched call.
    pub fn call_result(request_id: u64, outcome: Result<Value, PluginHostError>) -> Self {
        match outcome {
            Ok(value) => Self::Result {
                request_id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(e) => Self::Result {
                request_id,
                ok: false,
                result: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Sandbox → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SandboxMessage {
    /// Activation finished.
    Ready { id: u64 },
    /// Activation (or stop) failed.
    Error { id: u64, message: String },
    /// Host API request from guest code.
    #[serde(rename_all = "camelCase")]
    Call {
        request_id: u64,
        method: String,
        args: Value,
    },
    Stopped { id: u64 },
}
