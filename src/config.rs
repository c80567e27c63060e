//! Referee configuration: broker identity from the environment, mission from TOML

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::covercode;
use crate::environment::EnvironmentsConfig;
use crate::fixture::{TestFixture, TestPlan};
use crate::handlers::{
    Action, GolfScoring, HandlerKind, HandlerRegistry, HandlerSettings, RankScoring,
    DEFAULT_FUNCTION_NAME,
};
use crate::representation::Representation;
use crate::session::SessionIdentity;
use crate::validator::{ValidatorKind, DEFAULT_FLOAT_PRECISION};

pub const DEFAULT_CONFIG_PATH: &str = "./referee.toml";

/// Where the broker is and who we are to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user_connection_id: String,
    pub docker_id: String,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("BROKER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let port = required_var("BROKER_PORT")?
            .parse::<u16>()
            .context("BROKER_PORT must be a port number")?;
        Ok(Self {
            host,
            port,
            user_connection_id: required_var("USER_CONNECTION_ID")?,
            docker_id: required_var("DOCKER_ID")?,
        })
    }

    pub fn identity(&self) -> SessionIdentity {
        SessionIdentity::new(&self.user_connection_id, &self.docker_id)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("{} is not set", name))
}

/// Everything loaded from the mission file
#[derive(Debug, Clone)]
pub struct MissionConfig {
    pub environments: EnvironmentsConfig,
    pub settings: HandlerSettings,
    pub handlers: HandlerRegistry,
}

#[derive(Debug, Deserialize)]
struct RawMission {
    #[serde(default)]
    environments: HashMap<String, PathBuf>,
    #[serde(default)]
    sandbox: RawSandbox,
    #[serde(default)]
    check: RawCheck,
    #[serde(default)]
    tests: BTreeMap<String, Vec<TestFixture>>,
    tests_file: Option<PathBuf>,
    #[serde(default)]
    handlers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawSandbox {
    #[serde(default = "default_listen_host")]
    listen_host: String,
    #[serde(default)]
    listen_port: u16,
    request_timeout_secs: Option<u64>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

impl Default for RawSandbox {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: 0,
            request_timeout_secs: None,
            env: BTreeMap::new(),
        }
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Default, Deserialize)]
struct RawCheck {
    default_function_name: Option<String>,
    #[serde(default)]
    function_names: HashMap<String, String>,
    #[serde(default)]
    cover_codes: HashMap<String, String>,
    random_seed: Option<u64>,
    #[serde(default)]
    validator: RawValidator,
    #[serde(default)]
    representations: HashMap<String, Representation>,
    #[serde(default)]
    golf: RawGolf,
    rank: Option<RawRank>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawValidator {
    #[default]
    Equal,
    FloatEqual {
        #[serde(default = "default_precision")]
        precision: i32,
    },
}

fn default_precision() -> i32 {
    DEFAULT_FLOAT_PRECISION
}

#[derive(Debug, Default, Deserialize)]
struct RawGolf {
    default_max_length: Option<usize>,
    base_points: Option<i64>,
    #[serde(default)]
    max_lengths: HashMap<String, usize>,
}

#[derive(Debug, Deserialize)]
struct RawRank {
    #[serde(default)]
    category_points: HashMap<String, i64>,
}

impl MissionConfig {
    /// Load a mission file; relative paths in it resolve against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read mission config {:?}", path))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, base_dir)
            .with_context(|| format!("Invalid mission config {:?}", path))
    }

    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let raw: RawMission = toml::from_str(content)?;
        let resolve = |path: PathBuf| {
            if path.is_relative() {
                base_dir.join(path)
            } else {
                path
            }
        };

        let environments = EnvironmentsConfig {
            executables: raw
                .environments
                .into_iter()
                .map(|(name, path)| (name, resolve(path)))
                .collect(),
            listen_host: raw.sandbox.listen_host,
            listen_port: raw.sandbox.listen_port,
            request_timeout: raw.sandbox.request_timeout_secs.map(Duration::from_secs),
            env: raw.sandbox.env.into_iter().collect(),
        };

        let mut tests = TestPlan::new(raw.tests);
        if let Some(tests_file) = raw.tests_file {
            for (category, fixtures) in TestPlan::from_json_file(&resolve(tests_file))?.iter() {
                tests.insert(category, fixtures.to_vec());
            }
        }

        let check = raw.check;
        let settings = HandlerSettings {
            tests,
            default_function_name: check
                .default_function_name
                .unwrap_or_else(|| DEFAULT_FUNCTION_NAME.into()),
            function_names: check.function_names,
            cover_codes: check
                .cover_codes
                .into_iter()
                .map(|(env, code)| (env, covercode::resolve(&code)))
                .collect(),
            random_seed: check.random_seed,
            validator: match check.validator {
                RawValidator::Equal => ValidatorKind::Equal,
                RawValidator::FloatEqual { precision } => ValidatorKind::FloatEqual { precision },
            },
            representations: check.representations,
        };

        let defaults = GolfScoring::default();
        let golf = GolfScoring {
            default_max_length: check.golf.default_max_length.unwrap_or(defaults.default_max_length),
            max_lengths: check.golf.max_lengths,
            base_points: check.golf.base_points.unwrap_or(defaults.base_points),
        };
        let rank = match check.rank {
            Some(raw) if !raw.category_points.is_empty() => RankScoring {
                category_points: raw.category_points,
            },
            _ => RankScoring::default(),
        };

        let mut handlers = HandlerRegistry::default();
        for (action, kind) in raw.handlers {
            let action: Action = action.parse()?;
            let kind = HandlerKind::from_name(&kind, &golf, &rank)
                .with_context(|| format!("Invalid handler for action {}", action))?;
            handlers = handlers.with_handler(action, kind);
        }

        Ok(Self {
            environments,
            settings,
            handlers,
        })
    }
}

/// Full referee configuration
#[derive(Debug, Clone)]
pub struct RefereeConfig {
    pub broker: BrokerConfig,
    pub mission: MissionConfig,
}

impl RefereeConfig {
    /// `REFEREE_CONFIG` names the mission file; broker settings come from the environment
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("REFEREE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let mission = MissionConfig::load(Path::new(&path))?;
        Ok(Self {
            broker: BrokerConfig::from_env()?,
            mission,
        })
    }
}
