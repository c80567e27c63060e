//! Environment module - sandbox subprocess pool and RPC clients
//!
//! This module handles:
//! - Spawning sandbox subprocesses and streaming their stdout/stderr
//! - The listening socket sandboxes connect back to, and handshake correlation
//! - One `SandboxClient` per live connection, issuing strictly sequential requests
//! - Teardown of every live sandbox
//!
//! The environment module does NOT:
//! - Interpret run results (that's the handlers' job)
//! - Know about tests, validators or the broker

pub mod client;
pub mod controller;
pub mod server;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SandboxError;

// Re-exports for convenience
pub use client::{ReleaseHook, SandboxClient, SandboxConnection};
pub use controller::{EnvironmentsConfig, EnvironmentsController};
pub use server::EnvironmentsServer;

/// Line callback: `(environment_id, line)`
pub type LineCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Where a sandbox's stdout/stderr lines go
#[derive(Clone)]
pub struct OutputCallbacks {
    pub on_stdout: LineCallback,
    pub on_stderr: LineCallback,
}

impl OutputCallbacks {
    pub fn new(on_stdout: LineCallback, on_stderr: LineCallback) -> Self {
        Self {
            on_stdout,
            on_stderr,
        }
    }

    pub fn discard() -> Self {
        Self::new(Arc::new(|_, _| {}), Arc::new(|_, _| {}))
    }
}

/// Source of ready sandbox clients
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Whether the mission supports this environment name
    fn is_valid_env(&self, env_name: &str) -> bool;

    /// Start a sandbox for the environment and wait for its handshake
    async fn acquire(
        &self,
        env_name: &str,
        output: OutputCallbacks,
    ) -> Result<SandboxClient, SandboxError>;

    /// Stop every live sandbox; returns how many were stopped
    async fn stop_all(&self) -> usize;
}
