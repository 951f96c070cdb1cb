//! Run configuration.
//!
//! Values come from three places, in precedence order:
//! 1. Environment variables already set when the orchestrator starts
//! 2. Config files (`./speedrun.toml`, then `~/.speedrun/config.toml`)
//! 3. Built-in defaults
//!
//! Files and built-ins are both applied through [`EnvironmentManager::set_default`], so an
//! externally set variable is never clobbered. [`RunConfig::resolve`] then freezes the
//! result; nothing changes it once stages start.

use crate::environment::EnvironmentManager;
use crate::error::ConfigError;
use crate::runner::ProcessEnv;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Variable names shared with the external training scripts.
pub mod keys {
    pub const BASE_DIR: &str = "NANOCHAT_BASE_DIR";
    pub const RUN_ID: &str = "WANDB_RUN";
    pub const NPROC_PER_NODE: &str = "NPROC_PER_NODE";
    pub const RUN_EVAL: &str = "NANOCHAT_RUN_EVAL";
    pub const RUN_LOSS: &str = "NANOCHAT_RUN_LOSS";
    pub const RUN_RL: &str = "NANOCHAT_RUN_RL";
    pub const OMP_NUM_THREADS: &str = "OMP_NUM_THREADS";
}

/// Run identifier meaning "no experiment tracking".
pub const NO_TRACKING_RUN: &str = "dummy";

pub const LOCAL_CONFIG_FILE: &str = "speedrun.toml";

/// On-disk configuration. Every field is optional; unset fields fall through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub base_dir: Option<PathBuf>,

    /// Run identifier (experiment tracking name)
    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub nproc_per_node: Option<u32>,

    #[serde(default)]
    pub eval: Option<bool>,

    #[serde(default)]
    pub loss: Option<bool>,

    #[serde(default)]
    pub rl: Option<bool>,

    #[serde(default)]
    pub omp_num_threads: Option<u32>,

    #[serde(default)]
    pub training: TrainingSection,

    #[serde(default)]
    pub tools: ToolsSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingSection {
    pub depth: Option<u32>,
    pub initial_shards: Option<u32>,
    pub total_shards: Option<u32>,
    pub tokenizer_max_chars: Option<u64>,
    /// Optional dependency group passed to `uv sync --extra`
    pub dependency_extra: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsSection {
    pub python: Option<String>,
    pub uv: Option<String>,
    pub torchrun: Option<String>,
    pub curl: Option<String>,
}

impl ConfigFile {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read { path: path.to_path_buf(), reason: e.to_string() })?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::Parse { path: path.to_path_buf(), reason: e.to_string() })
    }

    pub fn default_global_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".speedrun").join("config.toml"))
    }

    /// Loads the global file, then the project-local file on top of it.
    ///
    /// Missing files are skipped; unreadable or malformed ones are errors.
    pub fn discover_and_load(project_dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let candidates = Self::default_global_path()
            .into_iter()
            .chain(std::iter::once(project_dir.join(LOCAL_CONFIG_FILE)));

        for path in candidates {
            match Self::load_from_file(&path) {
                Ok(file) => config.merge(&file),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(config)
    }

    /// Values set in `other` override values in `self`.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }

        take(&mut self.base_dir, &other.base_dir);
        take(&mut self.run, &other.run);
        take(&mut self.nproc_per_node, &other.nproc_per_node);
        take(&mut self.eval, &other.eval);
        take(&mut self.loss, &other.loss);
        take(&mut self.rl, &other.rl);
        take(&mut self.omp_num_threads, &other.omp_num_threads);

        take(&mut self.training.depth, &other.training.depth);
        take(&mut self.training.initial_shards, &other.training.initial_shards);
        take(&mut self.training.total_shards, &other.training.total_shards);
        take(&mut self.training.tokenizer_max_chars, &other.training.tokenizer_max_chars);
        take(&mut self.training.dependency_extra, &other.training.dependency_extra);

        take(&mut self.tools.python, &other.tools.python);
        take(&mut self.tools.uv, &other.tools.uv);
        take(&mut self.tools.torchrun, &other.tools.torchrun);
        take(&mut self.tools.curl, &other.tools.curl);
    }

    /// Feeds file values into the environment as defaults.
    pub fn apply_defaults(&self, env: &mut EnvironmentManager) {
        if let Some(ref dir) = self.base_dir {
            env.set_default(keys::BASE_DIR, dir.display().to_string());
        }
        if let Some(ref run) = self.run {
            env.set_default(keys::RUN_ID, run.clone());
        }
        if let Some(n) = self.nproc_per_node {
            env.set_default(keys::NPROC_PER_NODE, n.to_string());
        }
        if let Some(flag) = self.eval {
            env.set_default(keys::RUN_EVAL, flag_value(flag));
        }
        if let Some(flag) = self.loss {
            env.set_default(keys::RUN_LOSS, flag_value(flag));
        }
        if let Some(flag) = self.rl {
            env.set_default(keys::RUN_RL, flag_value(flag));
        }
        if let Some(n) = self.omp_num_threads {
            env.set_default(keys::OMP_NUM_THREADS, n.to_string());
        }
    }
}

/// Built-in defaults, applied after any file values.
pub fn apply_builtin_defaults(env: &mut EnvironmentManager) {
    env.set_default(keys::OMP_NUM_THREADS, "1");
    env.set_default(keys::BASE_DIR, default_base_dir().display().to_string());
    env.set_default(keys::RUN_ID, NO_TRACKING_RUN);
    env.set_default(keys::NPROC_PER_NODE, "1");
    env.set_default(keys::RUN_EVAL, "1");
    env.set_default(keys::RUN_LOSS, "1");
    env.set_default(keys::RUN_RL, "0");
}

/// `~/.cache/nanochat`, or a relative `.cache/nanochat` when there is no home directory.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".cache").join("nanochat")
}

fn flag_value(flag: bool) -> &'static str {
    if flag { "1" } else { "0" }
}

/// Parses a boolean-like setting.
pub fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected one of 1/0, true/false, yes/no, on/off".to_string(),
        }),
    }
}

/// Parses a strictly positive count.
pub fn parse_count(key: &str, raw: &str) -> Result<u32, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let n: u32 = raw.trim().parse().map_err(|_| invalid("expected a positive integer"))?;
    if n == 0 {
        return Err(invalid("must be >= 1"));
    }
    Ok(n)
}

/// Knobs forwarded to the training scripts as arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingParams {
    pub depth: u32,
    pub initial_shards: u32,
    pub total_shards: u32,
    pub tokenizer_max_chars: u64,
    pub dependency_extra: String,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            depth: 20,
            initial_shards: 8,
            total_shards: 240,
            tokenizer_max_chars: 2_000_000_000,
            dependency_extra: "gpu".to_string(),
        }
    }
}

impl TrainingParams {
    fn from_section(section: &TrainingSection) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let params = Self {
            depth: section.depth.unwrap_or(defaults.depth),
            initial_shards: section.initial_shards.unwrap_or(defaults.initial_shards),
            total_shards: section.total_shards.unwrap_or(defaults.total_shards),
            tokenizer_max_chars: section.tokenizer_max_chars.unwrap_or(defaults.tokenizer_max_chars),
            dependency_extra: section.dependency_extra.clone().unwrap_or(defaults.dependency_extra),
        };

        if params.depth == 0 {
            return Err(invalid_training("depth", params.depth, "must be >= 1"));
        }
        if params.initial_shards == 0 {
            return Err(invalid_training("initial_shards", params.initial_shards, "must be >= 1"));
        }
        if params.total_shards < params.initial_shards {
            return Err(invalid_training(
                "total_shards",
                params.total_shards,
                "must be >= training.initial_shards",
            ));
        }
        Ok(params)
    }
}

fn invalid_training(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("training.{field}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Program names for the external collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPrograms {
    pub python: String,
    pub uv: String,
    pub torchrun: String,
    pub curl: String,
}

impl Default for ToolPrograms {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            uv: "uv".to_string(),
            torchrun: "torchrun".to_string(),
            curl: "curl".to_string(),
        }
    }
}

impl ToolPrograms {
    fn from_section(section: &ToolsSection) -> Self {
        let defaults = Self::default();
        Self {
            python: section.python.clone().unwrap_or(defaults.python),
            uv: section.uv.clone().unwrap_or(defaults.uv),
            torchrun: section.torchrun.clone().unwrap_or(defaults.torchrun),
            curl: section.curl.clone().unwrap_or(defaults.curl),
        }
    }
}

/// Frozen configuration shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunConfig {
    pub base_dir: PathBuf,
    pub run_id: String,
    pub nproc_per_node: u32,
    pub eval_enabled: bool,
    pub loss_enabled: bool,
    pub rl_enabled: bool,
    /// Thread hint for numeric libraries, forwarded verbatim
    pub omp_num_threads: String,
    pub training: TrainingParams,
    pub tools: ToolPrograms,
    #[serde(skip)]
    process_env: ProcessEnv,
}

impl RunConfig {
    /// Freezes the current state of `env` (plus file-only sections) into a config.
    ///
    /// Settings missing from `env` fall back to the built-in defaults.
    pub fn resolve(env: &EnvironmentManager, file: &ConfigFile) -> Result<Self, ConfigError> {
        let read = |key: &str, fallback: &str| env.get(key).unwrap_or_else(|| fallback.to_string());

        let base_dir = env.get(keys::BASE_DIR).map_or_else(default_base_dir, PathBuf::from);
        let run_id = read(keys::RUN_ID, NO_TRACKING_RUN);
        let nproc_per_node = parse_count(keys::NPROC_PER_NODE, &read(keys::NPROC_PER_NODE, "1"))?;
        let eval_enabled = parse_flag(keys::RUN_EVAL, &read(keys::RUN_EVAL, "1"))?;
        let loss_enabled = parse_flag(keys::RUN_LOSS, &read(keys::RUN_LOSS, "1"))?;
        let rl_enabled = parse_flag(keys::RUN_RL, &read(keys::RUN_RL, "0"))?;
        // Only the file value is ours to check; anything the user exported is passed through.
        if let Some(n) = file.omp_num_threads {
            parse_count(keys::OMP_NUM_THREADS, &n.to_string())?;
        }
        let omp_num_threads = read(keys::OMP_NUM_THREADS, "1");

        if run_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: keys::RUN_ID.to_string(),
                value: run_id,
                reason: "must not be empty".to_string(),
            });
        }

        let mut process_env = env.process_env();
        let rendered: BTreeMap<&str, String> = BTreeMap::from([
            (keys::BASE_DIR, base_dir.display().to_string()),
            (keys::RUN_ID, run_id.clone()),
            (keys::NPROC_PER_NODE, nproc_per_node.to_string()),
            (keys::RUN_EVAL, flag_value(eval_enabled).to_string()),
            (keys::RUN_LOSS, flag_value(loss_enabled).to_string()),
            (keys::RUN_RL, flag_value(rl_enabled).to_string()),
            (keys::OMP_NUM_THREADS, omp_num_threads.clone()),
        ]);
        for (key, value) in rendered {
            process_env.vars.insert(key.to_string(), value);
        }

        Ok(Self {
            base_dir,
            run_id,
            nproc_per_node,
            eval_enabled,
            loss_enabled,
            rl_enabled,
            omp_num_threads,
            training: TrainingParams::from_section(&file.training)?,
            tools: ToolPrograms::from_section(&file.tools),
            process_env,
        })
    }

    /// Environment and working directory every stage is launched with.
    pub fn process_env(&self) -> &ProcessEnv {
        &self.process_env
    }

    pub fn project_dir(&self) -> &Path {
        &self.process_env.cwd
    }

    /// Whether training stages go through the distributed launcher.
    #[must_use]
    pub fn distributed(&self) -> bool {
        self.nproc_per_node > 1
    }
}
