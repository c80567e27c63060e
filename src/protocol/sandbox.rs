//! Sandbox RPC messages
//!
//! Requests are `{action, ...fields}`; replies are `{status, result?}`; the
//! first frame on a fresh connection is the handshake
//! `{status: "connected", environment_id}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SandboxError;

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_CONNECTED: &str = "connected";

/// Request sent from the referee to a sandbox
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SandboxRequest {
    RunCode {
        code: String,
    },
    RunFunction {
        function_name: String,
        function_args: Value,
    },
    RunCodeAndFunction {
        code: String,
        function_name: String,
        function_args: Value,
    },
    RunInConsole {
        code: String,
    },
    Config {
        env_config: Value,
    },
    Stop,
}

impl SandboxRequest {
    pub fn action(&self) -> &'static str {
        match self {
            SandboxRequest::RunCode { .. } => "run_code",
            SandboxRequest::RunFunction { .. } => "run_function",
            SandboxRequest::RunCodeAndFunction { .. } => "run_code_and_function",
            SandboxRequest::RunInConsole { .. } => "run_in_console",
            SandboxRequest::Config { .. } => "config",
            SandboxRequest::Stop => "stop",
        }
    }
}

/// First frame a sandbox sends after connecting back
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Handshake {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub environment_id: Option<String>,
}

impl Handshake {
    /// The environment id of a well-formed `connected` handshake
    pub fn connected_id(&self) -> Result<&str, SandboxError> {
        let id = self
            .environment_id
            .as_deref()
            .ok_or_else(|| SandboxError::Protocol("handshake without environment_id".into()))?;

        match self.status.as_deref() {
            Some(STATUS_CONNECTED) => Ok(id),
            other => Err(SandboxError::Protocol(format!(
                "wrong connection message for {}: status {:?}",
                id, other
            ))),
        }
    }
}

/// Raw reply to a sandbox request
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxReply(Value);

impl SandboxReply {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn status(&self) -> Option<&str> {
        self.0.get("status").and_then(Value::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.status() == Some(STATUS_SUCCESS)
    }

    /// The `result` field, `Null` when absent
    pub fn result(&self) -> Value {
        self.0.get("result").cloned().unwrap_or(Value::Null)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}
