//! Idempotent tool bootstrap.
//!
//! A [`ToolRequirement`] names a binary, how to install it natively, and how to install it
//! through a shell script when no native installer exists. [`ToolBootstrapper::ensure_tool`]
//! never fails: a tool that cannot be resolved becomes a [`BootstrapWarning`] and the run
//! continues in degraded mode.

pub mod detection;

use crate::environment::EnvironmentManager;
use crate::error::BootstrapWarning;
use crate::runner::{CommandRunner, CommandSpec};
use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Programs the shell-based fallback needs on the host.
const SHELL_FALLBACK_PREREQS: &[&str] = &["sh", "curl"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRequirement {
    /// Human-readable name used in logs
    pub name: String,
    /// Binary whose presence satisfies the requirement
    pub binary: String,
    /// Platform package manager invocation, if this host family has one
    pub native_install: Option<CommandSpec>,
    /// Script piped through `sh`
    pub shell_install: Option<String>,
    /// Where an install drops the binary; prepended to the search path afterwards
    pub install_dirs: Vec<PathBuf>,
}

impl ToolRequirement {
    /// The `uv` Python package manager.
    pub fn uv() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self {
            name: "uv".to_string(),
            binary: "uv".to_string(),
            native_install: native_install_for("astral-sh.uv", "uv"),
            shell_install: Some("curl -LsSf https://astral.sh/uv/install.sh | sh".to_string()),
            install_dirs: vec![home.join(".local").join("bin"), home.join(".cargo").join("bin")],
        }
    }

    /// The Rust toolchain, needed to build the tokenizer extension.
    pub fn rust_toolchain() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self {
            name: "rust toolchain".to_string(),
            binary: "cargo".to_string(),
            native_install: native_install_for("Rustlang.Rustup", "rustup"),
            shell_install: Some(
                "curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y".to_string(),
            ),
            install_dirs: vec![home.join(".cargo").join("bin")],
        }
    }
}

#[cfg(target_os = "windows")]
fn native_install_for(winget_id: &str, _brew_formula: &str) -> Option<CommandSpec> {
    Some(CommandSpec::new(
        "winget",
        ["install", "--exact", "--silent", "--id", winget_id],
    ))
}

#[cfg(target_os = "macos")]
fn native_install_for(_winget_id: &str, brew_formula: &str) -> Option<CommandSpec> {
    Some(CommandSpec::new("brew", ["install", brew_formula]))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn native_install_for(_winget_id: &str, _brew_formula: &str) -> Option<CommandSpec> {
    None
}

/// Best install mechanism the host offers for a given requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallCapability {
    Native,
    ShellFallback,
    Unavailable,
}

/// Host capability provider.
pub trait ToolChecker: Send + Sync {
    fn is_present(&self, binary: &str, search_path: &OsStr) -> bool;

    fn capability(&self, requirement: &ToolRequirement, search_path: &OsStr) -> InstallCapability {
        if let Some(ref native) = requirement.native_install {
            if self.is_present(&native.program, search_path) {
                return InstallCapability::Native;
            }
        }
        if requirement.shell_install.is_some()
            && SHELL_FALLBACK_PREREQS.iter().all(|bin| self.is_present(bin, search_path))
        {
            return InstallCapability::ShellFallback;
        }
        InstallCapability::Unavailable
    }
}

/// Looks binaries up on the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemToolChecker;

impl ToolChecker for SystemToolChecker {
    fn is_present(&self, binary: &str, search_path: &OsStr) -> bool {
        detection::find_executable(binary, search_path).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyPresent,
    Installed,
    Unresolved(BootstrapWarning),
}

impl EnsureOutcome {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Unresolved(_))
    }
}

pub struct ToolBootstrapper {
    checker: Arc<dyn ToolChecker>,
    runner: Arc<dyn CommandRunner>,
    /// Requirements whose install procedure already ran (or was found unavailable)
    attempted: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for ToolBootstrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBootstrapper").finish_non_exhaustive()
    }
}

impl ToolBootstrapper {
    pub fn new(checker: Arc<dyn ToolChecker>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { checker, runner, attempted: Mutex::new(HashSet::new()) }
    }

    /// Makes sure `requirement` is satisfied, installing it if needed.
    ///
    /// The install procedure runs at most once per requirement for the lifetime of the
    /// bootstrapper. Unresolved outcomes are logged and recorded on `env`.
    pub async fn ensure_tool(
        &self,
        requirement: &ToolRequirement,
        env: &mut EnvironmentManager,
    ) -> EnsureOutcome {
        if self.checker.is_present(&requirement.binary, &env.search_path()) {
            debug!(tool = %requirement.name, "Tool already present");
            return EnsureOutcome::AlreadyPresent;
        }

        if !self.mark_attempted(&requirement.name) {
            let warning = BootstrapWarning::InstallFailure {
                tool: requirement.name.clone(),
                reason: "install already attempted in this run".to_string(),
            };
            debug!(tool = %requirement.name, "Skipping repeated install attempt");
            return EnsureOutcome::Unresolved(warning);
        }

        let outcome = self.install(requirement, env).await;
        if let EnsureOutcome::Unresolved(ref warning) = outcome {
            warn!(tool = %requirement.name, "{warning}");
            env.push_warning(warning.clone());
        }
        outcome
    }

    /// Returns false if an attempt was already recorded.
    fn mark_attempted(&self, name: &str) -> bool {
        self.attempted.lock().unwrap_or_else(PoisonError::into_inner).insert(name.to_string())
    }

    async fn install(&self, requirement: &ToolRequirement, env: &mut EnvironmentManager) -> EnsureOutcome {
        let search_path = env.search_path();
        let command = match self.checker.capability(requirement, &search_path) {
            InstallCapability::Native => requirement.native_install.clone(),
            InstallCapability::ShellFallback => requirement.shell_install.clone().map(CommandSpec::shell),
            InstallCapability::Unavailable => None,
        };

        let Some(command) = command else {
            return EnsureOutcome::Unresolved(BootstrapWarning::MissingTool {
                tool: requirement.name.clone(),
            });
        };

        info!(tool = %requirement.name, command = %command, "Installing missing tool");
        let status = self.runner.run(&command, &env.process_env()).await;
        if !status.success() {
            return EnsureOutcome::Unresolved(BootstrapWarning::InstallFailure {
                tool: requirement.name.clone(),
                reason: status.to_string(),
            });
        }

        for dir in requirement.install_dirs.iter().rev() {
            env.prepend_search_path(dir);
        }

        if self.checker.is_present(&requirement.binary, &env.search_path()) {
            info!(tool = %requirement.name, "Tool installed");
            EnsureOutcome::Installed
        } else {
            EnsureOutcome::Unresolved(BootstrapWarning::InstallFailure {
                tool: requirement.name.clone(),
                reason: format!("installer succeeded but '{}' is still not on the search path", requirement.binary),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MapEnvSource;
    use crate::runner::{ExitOutcome, ProcessEnv};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Binaries become present once `install_works` is set and an install ran.
    struct FakeChecker {
        present: Vec<&'static str>,
        installed: AtomicBool,
        install_binary: &'static str,
    }

    impl ToolChecker for FakeChecker {
        fn is_present(&self, binary: &str, _search_path: &OsStr) -> bool {
            self.present.contains(&binary)
                || (binary == self.install_binary && self.installed.load(Ordering::SeqCst))
        }
    }

    struct CountingRunner {
        calls: AtomicUsize,
        exit: i32,
        checker: Arc<FakeChecker>,
    }

    #[async_trait]
    impl CommandRunner for CountingRunner {
        async fn run(&self, _command: &CommandSpec, _env: &ProcessEnv) -> ExitOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.exit == 0 {
                self.checker.installed.store(true, Ordering::SeqCst);
            }
            ExitOutcome::Exited(self.exit)
        }
    }

    fn requirement() -> ToolRequirement {
        ToolRequirement {
            name: "uv".to_string(),
            binary: "uv".to_string(),
            native_install: None,
            shell_install: Some("curl -LsSf https://astral.sh/uv/install.sh | sh".to_string()),
            install_dirs: vec![PathBuf::from("/home/dev/.local/bin")],
        }
    }

    fn setup(present: Vec<&'static str>, exit: i32) -> (ToolBootstrapper, Arc<CountingRunner>, EnvironmentManager) {
        let checker = Arc::new(FakeChecker { present, installed: AtomicBool::new(false), install_binary: "uv" });
        let runner = Arc::new(CountingRunner { calls: AtomicUsize::new(0), exit, checker: Arc::clone(&checker) });
        let env = EnvironmentManager::new(
            Box::new(MapEnvSource::from_pairs([("PATH", "/usr/bin")])),
            PathBuf::from("."),
        );
        (ToolBootstrapper::new(checker, runner.clone()), runner, env)
    }

    #[tokio::test]
    async fn test_present_tool_is_a_no_op() {
        let (bootstrapper, runner, mut env) = setup(vec!["uv"], 0);

        assert_eq!(bootstrapper.ensure_tool(&requirement(), &mut env).await, EnsureOutcome::AlreadyPresent);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(env.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_shell_fallback_installs_once() {
        let (bootstrapper, runner, mut env) = setup(vec!["sh", "curl"], 0);

        assert_eq!(bootstrapper.ensure_tool(&requirement(), &mut env).await, EnsureOutcome::Installed);
        assert_eq!(bootstrapper.ensure_tool(&requirement(), &mut env).await, EnsureOutcome::AlreadyPresent);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);

        let first = std::env::split_paths(&env.search_path()).next().unwrap();
        assert_eq!(first, PathBuf::from("/home/dev/.local/bin"));
    }

    #[tokio::test]
    async fn test_failed_install_is_not_retried() {
        let (bootstrapper, runner, mut env) = setup(vec!["sh", "curl"], 1);

        let first = bootstrapper.ensure_tool(&requirement(), &mut env).await;
        let second = bootstrapper.ensure_tool(&requirement(), &mut env).await;

        assert!(matches!(first, EnsureOutcome::Unresolved(BootstrapWarning::InstallFailure { .. })));
        assert!(!second.is_resolved());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(env.warnings().len(), 1);
    }

    #[tokio::test]
    async fn test_poisoned_attempt_log_still_blocks_reinstall() {
        let (bootstrapper, runner, mut env) = setup(vec!["sh", "curl"], 1);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _held = bootstrapper.attempted.lock().unwrap();
            panic!("lock holder died");
        }));
        assert!(bootstrapper.attempted.is_poisoned());

        bootstrapper.ensure_tool(&requirement(), &mut env).await;
        bootstrapper.ensure_tool(&requirement(), &mut env).await;

        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_install_mechanism_warns() {
        let (bootstrapper, runner, mut env) = setup(vec![], 0);

        let outcome = bootstrapper.ensure_tool(&requirement(), &mut env).await;

        assert_eq!(
            outcome,
            EnsureOutcome::Unresolved(BootstrapWarning::MissingTool { tool: "uv".to_string() })
        );
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(env.warnings().len(), 1);
    }

    #[test]
    fn test_capability_prefers_native() {
        let checker = FakeChecker { present: vec!["brew", "sh", "curl"], installed: AtomicBool::new(false), install_binary: "uv" };
        let mut req = requirement();
        let path = OsStr::new("");

        assert_eq!(checker.capability(&req, path), InstallCapability::ShellFallback);

        req.native_install = Some(CommandSpec::new("brew", ["install", "uv"]));
        assert_eq!(checker.capability(&req, path), InstallCapability::Native);

        req.native_install = Some(CommandSpec::new("winget", ["install", "astral-sh.uv"]));
        req.shell_install = None;
        assert_eq!(checker.capability(&req, path), InstallCapability::Unavailable);
    }
}
