use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpeedrunError>;

/// Fatal errors. Anything in here ends the run before (or instead of) the final report.
#[derive(Debug, Error)]
pub enum SpeedrunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("report {action} failed: {reason}")]
    Report {
        /// `reset` or `generate`
        action: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse configuration file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue { key: String, value: String, reason: String },
}

/// Non-fatal problems. They are logged and collected, and the run carries on in degraded mode.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BootstrapWarning {
    #[error("tool '{tool}' is missing and no install mechanism is available on this host")]
    MissingTool { tool: String },

    #[error("failed to install tool '{tool}': {reason}")]
    InstallFailure { tool: String, reason: String },

    #[error("no activation script under {path}; using the ambient environment")]
    ActivationFailure { path: PathBuf },

    #[error("stage '{stage}' expected a background unit but none is outstanding")]
    BackgroundJoinFailure { stage: String },
}

impl BootstrapWarning {
    /// Short machine-friendly label, used in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingTool { .. } => "missing_tool",
            Self::InstallFailure { .. } => "install_failure",
            Self::ActivationFailure { .. } => "activation_failure",
            Self::BackgroundJoinFailure { .. } => "background_join_failure",
        }
    }
}
