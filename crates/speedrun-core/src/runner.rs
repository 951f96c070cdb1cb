//! External command invocation.
//!
//! Every stage body, install procedure and report action is an opaque external program.
//! The orchestrator only cares about arguments in and exit status out.

use crate::bootstrap::detection::find_executable;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Program plus argument list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }

    /// `sh -c <script>`, used for the shell-based install fallbacks.
    pub fn shell(script: impl Into<String>) -> Self {
        Self { program: "sh".to_string(), args: vec!["-c".to_string(), script.into()] }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Variables and working directory forwarded to a child process.
///
/// Children inherit the orchestrator's own environment; `vars` are layered on top.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessEnv {
    pub vars: BTreeMap<String, String>,
    pub cwd: PathBuf,
}

impl ProcessEnv {
    #[must_use]
    pub fn new(cwd: PathBuf) -> Self {
        Self { vars: BTreeMap::new(), cwd }
    }

    /// The search path children will see.
    pub fn search_path(&self) -> OsString {
        self.vars
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default()
    }
}

/// How an external command ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum ExitOutcome {
    Exited(i32),
    /// Terminated by a signal, no exit code.
    Signaled,
    /// The program could not be started at all.
    SpawnFailed(String),
}

impl ExitOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Status to propagate as the orchestrator's own exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled => 1,
            Self::SpawnFailed(_) => 127,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signaled => f.write_str("terminated by signal"),
            Self::SpawnFailed(reason) => write!(f, "failed to start: {reason}"),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `command` to completion.
    async fn run(&self, command: &CommandSpec, env: &ProcessEnv) -> ExitOutcome;
}

/// Runs commands as real child processes with inherited stdio.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn resolve_program(program: &str, env: &ProcessEnv) -> PathBuf {
        find_executable(program, &env.search_path()).unwrap_or_else(|| PathBuf::from(program))
    }

    fn build(command: &CommandSpec, env: &ProcessEnv) -> Command {
        let program = Self::resolve_program(&command.program, env);
        let mut cmd = Command::new(program);
        cmd.args(&command.args).envs(&env.vars);
        if !env.cwd.as_os_str().is_empty() {
            cmd.current_dir(Path::new(&env.cwd));
        }
        cmd
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec, env: &ProcessEnv) -> ExitOutcome {
        debug!(command = %command, cwd = %env.cwd.display(), "Spawning external command");

        let mut child = match Self::build(command, env).spawn() {
            Ok(child) => child,
            Err(e) => return ExitOutcome::SpawnFailed(format!("{}: {e}", command.program)),
        };

        match child.wait().await {
            Ok(status) => status.code().map_or(ExitOutcome::Signaled, ExitOutcome::Exited),
            Err(e) => ExitOutcome::SpawnFailed(format!("{}: {e}", command.program)),
        }
    }
}
