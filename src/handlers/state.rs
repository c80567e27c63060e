use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::debug;

/// Where a handler is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    #[default]
    Idle,
    Acquiring,
    Configuring,
    LoadingCode,
    RunningTests,
    Reporting,
    Stopped,
}

/// Shared view of the active handler's state, read by `get_status`
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    state: Arc<Mutex<HandlerState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> HandlerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, next: HandlerState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            debug!("Handler state {:?} -> {:?}", previous, next);
        }
    }
}
