//! Handlers module - per-action sandbox workflows
//!
//! This module provides one handler per editor action:
//! - `RunHandler`: run the code once and report that it finished
//! - `RunInConsoleHandler`: an interactive loop of code snippets
//! - `CheckHandler`: run every test category and report pass/fail/points
//!
//! The handlers module does NOT:
//! - Talk to the broker directly except through `SessionClient`
//! - Spawn processes (sandboxes come from an `EnvironmentProvider`)

pub mod check;
pub mod console;
pub mod run;
pub mod scoring;
pub mod state;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::environment::{EnvironmentProvider, OutputCallbacks, SandboxClient};
use crate::fixture::TestPlan;
use crate::representation::Representation;
use crate::session::SessionClient;
use crate::validator::ValidatorKind;

pub use check::CheckHandler;
pub use console::RunInConsoleHandler;
pub use run::RunHandler;
pub use scoring::{CheckVariant, GolfScoring, RankScoring};
pub use state::{HandlerState, StateTracker};

pub const DEFAULT_FUNCTION_NAME: &str = "checkio";

/// Editor actions the referee dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Run,
    Check,
    TryIt,
    RunInConsole,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::Check => "check",
            Action::TryIt => "try_it",
            Action::RunInConsole => "run_in_console",
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run" => Ok(Action::Run),
            "check" => Ok(Action::Check),
            "try_it" => Ok(Action::TryIt),
            "run_in_console" => Ok(Action::RunInConsole),
            other => Err(anyhow!("Unknown action: {}", other)),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mission settings shared by every handler
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub tests: TestPlan,
    pub default_function_name: String,
    /// Environment name -> function the check calls
    pub function_names: HashMap<String, String>,
    /// Environment name -> cover code source
    pub cover_codes: HashMap<String, String>,
    pub random_seed: Option<u64>,
    pub validator: ValidatorKind,
    pub representations: HashMap<String, Representation>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            tests: TestPlan::default(),
            default_function_name: DEFAULT_FUNCTION_NAME.to_string(),
            function_names: HashMap::new(),
            cover_codes: HashMap::new(),
            random_seed: None,
            validator: ValidatorKind::default(),
            representations: HashMap::new(),
        }
    }
}

impl HandlerSettings {
    pub fn with_tests(mut self, tests: TestPlan) -> Self {
        self.tests = tests;
        self
    }

    pub fn function_name(&self, env_name: &str) -> &str {
        self.function_names
            .get(env_name)
            .map(String::as_str)
            .unwrap_or(&self.default_function_name)
    }

    pub fn representation(&self, env_name: &str) -> Representation {
        self.representations
            .get(env_name)
            .copied()
            .unwrap_or_default()
    }

    /// `config` payload the check sends to every fresh sandbox
    pub fn env_config(&self, env_name: &str) -> Value {
        let mut config = Map::new();
        if let Some(cover_code) = self.cover_codes.get(env_name) {
            config.insert("cover_code".into(), json!(cover_code));
        }
        if let Some(seed) = self.random_seed {
            config.insert("random_seed".into(), json!(seed));
        }
        Value::Object(config)
    }
}

/// `config` payload for run-style handlers, if the environment needs one
pub fn run_env_config(env_name: &str) -> Option<Value> {
    env_name
        .starts_with("python")
        .then(|| json!({ "global_name": "__main__" }))
}

/// Everything a handler needs for one session
#[derive(Clone)]
pub struct HandlerContext {
    pub action: Action,
    pub env_name: String,
    pub code: String,
    pub session: SessionClient,
    pub environments: Arc<dyn EnvironmentProvider>,
    pub settings: Arc<HandlerSettings>,
    pub state: StateTracker,
}

impl HandlerContext {
    /// Acquire a sandbox whose output is streamed to the broker
    pub async fn get_environment(&self) -> Result<SandboxClient> {
        self.state.set(HandlerState::Acquiring);
        let environment = self
            .environments
            .acquire(&self.env_name, self.output_callbacks())
            .await?;
        Ok(environment)
    }

    fn output_callbacks(&self) -> OutputCallbacks {
        let stdout = self.session.clone();
        let stderr = self.session.clone();
        OutputCallbacks::new(
            Arc::new(move |_, line| {
                if let Err(e) = stdout.send_stdout(line) {
                    warn!("Failed to forward stdout: {}", e);
                }
            }),
            Arc::new(move |_, line| {
                if let Err(e) = stderr.send_stderr(line) {
                    warn!("Failed to forward stderr: {}", e);
                }
            }),
        )
    }
}

/// One editor action's workflow
#[async_trait]
pub trait Handler: Send {
    /// Run the workflow, reporting through the session
    async fn start(&mut self) -> Result<()>;

    /// Stop the sandbox currently in use, if any. Safe to call repeatedly.
    async fn stop(&mut self);
}

/// Handler implementations the registry can map an action to
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerKind {
    Run,
    RunInConsole,
    Check(CheckVariant),
}

impl HandlerKind {
    /// Parse a `[handlers]` entry; golf and rank take their scoring parameters
    pub fn from_name(name: &str, golf: &GolfScoring, rank: &RankScoring) -> Result<Self> {
        match name {
            "run" => Ok(HandlerKind::Run),
            "run_in_console" => Ok(HandlerKind::RunInConsole),
            "check" => Ok(HandlerKind::Check(CheckVariant::Strict)),
            "golf_check" => Ok(HandlerKind::Check(CheckVariant::CodeGolf(golf.clone()))),
            "rank_check" => Ok(HandlerKind::Check(CheckVariant::Rank(rank.clone()))),
            other => Err(anyhow!("Unknown handler: {}", other)),
        }
    }

    pub fn build(&self, ctx: HandlerContext) -> Box<dyn Handler> {
        match self {
            HandlerKind::Run => Box::new(RunHandler::new(ctx)),
            HandlerKind::RunInConsole => Box::new(RunInConsoleHandler::new(ctx)),
            HandlerKind::Check(variant) => Box::new(CheckHandler::new(ctx, variant.clone())),
        }
    }
}

/// Action -> handler map, fixed once the referee starts
#[derive(Debug, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<Action, HandlerKind>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::empty()
            .with_handler(Action::Run, HandlerKind::Run)
            .with_handler(Action::Check, HandlerKind::Check(CheckVariant::Strict))
            .with_handler(Action::RunInConsole, HandlerKind::RunInConsole)
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn with_handler(mut self, action: Action, kind: HandlerKind) -> Self {
        self.handlers.insert(action, kind);
        self
    }

    pub fn get(&self, action: Action) -> Option<&HandlerKind> {
        self.handlers.get(&action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_has_no_try_it() {
        let registry = HandlerRegistry::default();
        assert_eq!(registry.get(Action::Run), Some(&HandlerKind::Run));
        assert!(registry.get(Action::TryIt).is_none());

        let registry = registry.with_handler(
            Action::Check,
            HandlerKind::from_name("rank_check", &GolfScoring::default(), &RankScoring::default())
                .unwrap(),
        );
        assert!(matches!(
            registry.get(Action::Check),
            Some(HandlerKind::Check(CheckVariant::Rank(_)))
        ));
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("run_in_console".parse::<Action>().unwrap(), Action::RunInConsole);
        assert!("deploy".parse::<Action>().is_err());
    }

    #[test]
    fn test_settings_env_config() {
        let mut settings = HandlerSettings::default();
        assert_eq!(settings.env_config("python_3"), json!({}));
        assert_eq!(settings.function_name("python_3"), "checkio");

        settings.cover_codes.insert("python_3".into(), "def cover(f, d): pass".into());
        settings.random_seed = Some(42);
        settings.function_names.insert("js_node".into(), "golf".into());
        assert_eq!(
            settings.env_config("python_3"),
            json!({"cover_code": "def cover(f, d): pass", "random_seed": 42})
        );
        assert_eq!(settings.env_config("js_node"), json!({"random_seed": 42}));
        assert_eq!(settings.function_name("js_node"), "golf");
    }

    #[test]
    fn test_run_env_config_only_for_python() {
        assert_eq!(run_env_config("python_3"), Some(json!({"global_name": "__main__"})));
        assert_eq!(run_env_config("js_node"), None);
    }
}
