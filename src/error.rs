//! Error taxonomy shared by the protocol, sandbox and session layers.
//!
//! Orchestration code (handlers, referee) works with `anyhow::Error` and
//! downcasts to `RefereeError` where a structured failure must be recovered.

use serde_json::{Map, Value};
use thiserror::Error;

/// Malformed frame on either wire protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("packet method `{0}` is not allowed")]
    MethodNotAllowed(String),
    #[error("frame payload contains the frame delimiter")]
    DelimiterInPayload,
}

/// Failures of the sandbox pool and sandbox RPC channel
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Handshake or correlation failure while spawning
    #[error("sandbox protocol error: {0}")]
    Protocol(String),
    /// A request's reply was not `success`, or the connection closed mid-request
    #[error("sandbox run failed: {reason}")]
    RunFailed { reason: String, reply: Option<Value> },
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn run_failed(reason: impl Into<String>, reply: Option<Value>) -> Self {
        SandboxError::RunFailed {
            reason: reason.into(),
            reply,
        }
    }

    pub fn is_run_failed(&self) -> bool {
        matches!(self, SandboxError::RunFailed { .. })
    }
}

/// Failures of the broker session
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker connection is closed")]
    Closed,
    #[error("result has already been sent for this session")]
    ResultAlreadySent,
    #[error("result action `{0}` is not allowed")]
    InvalidResultAction(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("broker io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Data attached to a failed check
#[derive(Debug, Clone, Default)]
pub struct ExecuteFailure {
    pub points: Option<i64>,
    pub description: Option<String>,
    pub additional_data: Option<Value>,
}

impl ExecuteFailure {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn with_additional_data(mut self, data: Option<Value>) -> Self {
        self.additional_data = data;
        self
    }

    /// Diagnostic payload for the broker: validator data plus `description`
    pub fn report_data(&self) -> Value {
        let description = self
            .description
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null);

        match &self.additional_data {
            Some(Value::Object(map)) => {
                let mut map = map.clone();
                map.insert("description".into(), description);
                Value::Object(map)
            }
            Some(other) => {
                let mut map = Map::new();
                map.insert("description".into(), description);
                map.insert("diagnostic".into(), other.clone());
                Value::Object(map)
            }
            None => {
                let mut map = Map::new();
                map.insert("description".into(), description);
                Value::Object(map)
            }
        }
    }
}

/// Structured check failures raised by handlers
#[derive(Debug, Error)]
pub enum RefereeError {
    /// Submitted code failed to load into a fresh sandbox
    #[error("code run failed: {}", .0.description.as_deref().unwrap_or("-"))]
    CodeRunFailed(ExecuteFailure),
    /// A fixture failed validation or its function call failed
    #[error("test failed: {}", .0.description.as_deref().unwrap_or("-"))]
    TestFailed(ExecuteFailure),
}

impl RefereeError {
    pub fn failure(&self) -> &ExecuteFailure {
        match self {
            RefereeError::CodeRunFailed(f) | RefereeError::TestFailed(f) => f,
        }
    }
}
