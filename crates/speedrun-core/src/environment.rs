//! Process-wide defaults, directory state and isolated-environment activation.
//!
//! The manager never writes to the orchestrator's own process environment. It keeps an
//! overlay of variables on top of an [`EnvSource`]; the overlay is what gets forwarded to
//! child processes once the run configuration is frozen.

use crate::error::{BootstrapWarning, Result};
use crate::runner::ProcessEnv;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const PATH_VAR: &str = "PATH";
pub const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";

/// Read-only view of the ambient environment.
pub trait EnvSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvSource;

impl EnvSource for ProcessEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed map, for tests and dry resolution.
#[derive(Debug, Default, Clone)]
pub struct MapEnvSource(pub HashMap<String, String>);

impl MapEnvSource {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl EnvSource for MapEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Where subsequent subprocesses run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    Ambient,
    Isolated { root: PathBuf, bin_dir: PathBuf },
}

impl ExecutionContext {
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        matches!(self, Self::Isolated { .. })
    }
}

pub struct EnvironmentManager {
    source: Box<dyn EnvSource>,
    overlay: BTreeMap<String, String>,
    context: ExecutionContext,
    project_dir: PathBuf,
    warnings: Vec<BootstrapWarning>,
}

impl std::fmt::Debug for EnvironmentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentManager")
            .field("overlay", &self.overlay)
            .field("context", &self.context)
            .field("project_dir", &self.project_dir)
            .finish_non_exhaustive()
    }
}

impl EnvironmentManager {
    pub fn new(source: Box<dyn EnvSource>, project_dir: PathBuf) -> Self {
        Self {
            source,
            overlay: BTreeMap::new(),
            context: ExecutionContext::Ambient,
            project_dir,
            warnings: Vec::new(),
        }
    }

    /// Manager over the real process environment.
    pub fn from_process(project_dir: PathBuf) -> Self {
        Self::new(Box::new(ProcessEnvSource), project_dir)
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Current value: overlay first, then the ambient environment.
    pub fn get(&self, key: &str) -> Option<String> {
        self.overlay.get(key).cloned().or_else(|| self.source.get(key))
    }

    /// Sets `key` only if nobody set it before. Returns whether the value was written.
    pub fn set_default(&mut self, key: &str, value: impl Into<String>) -> bool {
        if self.get(key).is_some() {
            return false;
        }
        let value = value.into();
        debug!(key = %key, value = %value, "Applying default");
        self.overlay.insert(key.to_string(), value);
        true
    }

    /// Creates `path` and its parents. Existing directories are fine.
    pub fn ensure_directory(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    pub fn search_path(&self) -> OsString {
        self.get(PATH_VAR).map(OsString::from).unwrap_or_default()
    }

    /// Puts `dir` in front of the forwarded search path, so a freshly installed tool is
    /// usable without restarting anything.
    pub fn prepend_search_path(&mut self, dir: &Path) {
        let current = self.search_path();
        let mut entries: Vec<PathBuf> = vec![dir.to_path_buf()];
        entries.extend(
            std::env::split_paths(&current).filter(|p| p != dir && !p.as_os_str().is_empty()),
        );

        match std::env::join_paths(entries) {
            Ok(joined) => {
                self.overlay.insert(PATH_VAR.to_string(), joined.to_string_lossy().into_owned());
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "Cannot add directory to search path"),
        }
    }

    /// Enters the virtual environment at `venv` for every later subprocess.
    ///
    /// Falls back to the ambient context with a warning when the activation artifact is
    /// missing.
    pub fn activate_environment(&mut self, venv: &Path) -> &ExecutionContext {
        let (activate, bin_dir) = activation_paths(venv);

        if !activate.is_file() {
            let warning = BootstrapWarning::ActivationFailure { path: venv.to_path_buf() };
            warn!("{warning}");
            self.warnings.push(warning);
            self.context = ExecutionContext::Ambient;
            return &self.context;
        }

        self.overlay.insert(VIRTUAL_ENV_VAR.to_string(), venv.display().to_string());
        self.prepend_search_path(&bin_dir);
        info!(venv = %venv.display(), "Activated isolated environment");

        self.context = ExecutionContext::Isolated { root: venv.to_path_buf(), bin_dir };
        &self.context
    }

    /// Records a warning raised on behalf of this environment.
    pub fn push_warning(&mut self, warning: BootstrapWarning) {
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[BootstrapWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<BootstrapWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Snapshot of what a child process launched right now would receive.
    pub fn process_env(&self) -> ProcessEnv {
        ProcessEnv { vars: self.overlay.clone(), cwd: self.project_dir.clone() }
    }
}

/// `(activation script, binary directory)` for a virtual environment root.
pub fn activation_paths(venv: &Path) -> (PathBuf, PathBuf) {
    let bin_dir = if cfg!(windows) { venv.join("Scripts") } else { venv.join("bin") };
    (bin_dir.join("activate"), bin_dir)
}
