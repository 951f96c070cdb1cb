//! Run report bracketing.
//!
//! The report itself is written by an external program. The orchestrator only guarantees
//! that `reset` succeeds before the first stage and that `generate` runs only after every
//! stage ran or was skipped.

use crate::config::RunConfig;
use crate::error::{Result, SpeedrunError};
use crate::runner::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const REPORT_MODULE: &str = "nanochat.report";

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Starts a fresh report (writes the header).
    async fn reset(&self, config: &RunConfig) -> Result<()>;

    /// Assembles the final report from what the stages logged.
    async fn generate(&self, config: &RunConfig) -> Result<()>;
}

/// Drives the report module through the configured Python interpreter.
pub struct CommandReportGenerator {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for CommandReportGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandReportGenerator").finish_non_exhaustive()
    }
}

impl CommandReportGenerator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn command(config: &RunConfig, action: &str) -> CommandSpec {
        CommandSpec::new(config.tools.python.clone(), ["-m", REPORT_MODULE, action])
    }

    async fn invoke(&self, config: &RunConfig, action: &'static str) -> Result<()> {
        let command = Self::command(config, action);
        info!(action, command = %command, "Running report action");

        let outcome = self.runner.run(&command, config.process_env()).await;
        if outcome.success() {
            Ok(())
        } else {
            Err(SpeedrunError::Report { action, reason: outcome.to_string() })
        }
    }
}

#[async_trait]
impl ReportGenerator for CommandReportGenerator {
    async fn reset(&self, config: &RunConfig) -> Result<()> {
        self.invoke(config, "reset").await
    }

    async fn generate(&self, config: &RunConfig) -> Result<()> {
        self.invoke(config, "generate").await
    }
}
