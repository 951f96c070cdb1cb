//! The speedrun pipeline: bootstrap, report reset, stage sequence, report generation.

use crate::bootstrap::{ToolBootstrapper, ToolChecker, ToolRequirement};
use crate::config::{apply_builtin_defaults, ConfigFile, RunConfig};
use crate::environment::{EnvironmentManager, ExecutionContext};
use crate::error::{BootstrapWarning, Result};
use crate::progress::ProgressSink;
use crate::report::ReportGenerator;
use crate::runner::{CommandRunner, CommandSpec};
use crate::sequencer::{PipelineResult, StageSequencer};
use crate::stage::{self, Stage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const VENV_DIR: &str = ".venv";
pub const IDENTITY_CONVERSATIONS_FILE: &str = "identity_conversations.jsonl";
pub const IDENTITY_CONVERSATIONS_URL: &str =
    "https://karpathy-public.s3.us-west-2.amazonaws.com/identity_conversations.jsonl";
const TOKENIZER_MANIFEST: &str = "rustbpe/Cargo.toml";

/// Runs a training script module, through `torchrun` when more than one process is
/// requested and straight through the interpreter otherwise.
pub fn launch_module(config: &RunConfig, module: &str, args: &[String]) -> CommandSpec {
    if config.distributed() {
        let mut argv = vec![
            "--standalone".to_string(),
            format!("--nproc_per_node={}", config.nproc_per_node),
            "-m".to_string(),
            module.to_string(),
        ];
        if !args.is_empty() {
            argv.push("--".to_string());
            argv.extend(args.iter().cloned());
        }
        CommandSpec::new(config.tools.torchrun.clone(), argv)
    } else {
        python_module(config, module, args)
    }
}

fn python_module(config: &RunConfig, module: &str, args: &[String]) -> CommandSpec {
    let mut argv = vec!["-m".to_string(), module.to_string()];
    argv.extend(args.iter().cloned());
    CommandSpec::new(config.tools.python.clone(), argv)
}

pub fn identity_conversations_path(config: &RunConfig) -> PathBuf {
    config.base_dir.join(IDENTITY_CONVERSATIONS_FILE)
}

/// The fixed stage order. Later stages read files earlier ones wrote, so the order is
/// not negotiable.
pub fn speedrun_stages(config: &RunConfig) -> Vec<Stage> {
    let training = &config.training;
    let run_arg = format!("--run={}", config.run_id);

    vec![
        Stage::new(
            "sync-dependencies",
            CommandSpec::new(config.tools.uv.clone(), ["sync", "--extra", training.dependency_extra.as_str()]),
        ),
        Stage::new(
            "build-tokenizer",
            CommandSpec::new(
                config.tools.uv.clone(),
                ["run", "maturin", "develop", "--release", "--manifest-path", TOKENIZER_MANIFEST],
            ),
        ),
        Stage::new(
            "dataset-initial",
            python_module(config, "nanochat.dataset", &["-n".to_string(), training.initial_shards.to_string()]),
        ),
        Stage::new(
            "dataset-full",
            python_module(config, "nanochat.dataset", &["-n".to_string(), training.total_shards.to_string()]),
        )
        .in_background(),
        Stage::new(
            "tokenizer-train",
            python_module(config, "scripts.tok_train", &[format!("--max_chars={}", training.tokenizer_max_chars)]),
        ),
        Stage::new("tokenizer-eval", python_module(config, "scripts.tok_eval", &[])),
        Stage::new(
            "base-train",
            launch_module(config, "scripts.base_train", &[format!("--depth={}", training.depth), run_arg.clone()]),
        )
        .after_background(),
        Stage::new("base-loss", launch_module(config, "scripts.base_loss", &[]))
            .skip_when(|c| !(c.eval_enabled && c.loss_enabled)),
        Stage::new("base-eval", launch_module(config, "scripts.base_eval", &[])).skip_when(|c| !c.eval_enabled),
        Stage::new(
            "identity-download",
            CommandSpec::new(
                config.tools.curl.clone(),
                [
                    "-L".to_string(),
                    "-o".to_string(),
                    identity_conversations_path(config).display().to_string(),
                    IDENTITY_CONVERSATIONS_URL.to_string(),
                ],
            ),
        ),
        Stage::new("mid-train", launch_module(config, "scripts.mid_train", &[run_arg.clone()])),
        Stage::new("mid-eval", launch_module(config, "scripts.chat_eval", &["-i".to_string(), "mid".to_string()]))
            .skip_when(|c| !c.eval_enabled),
        Stage::new("sft-train", launch_module(config, "scripts.chat_sft", &[run_arg.clone()])),
        Stage::new("sft-eval", launch_module(config, "scripts.chat_eval", &["-i".to_string(), "sft".to_string()]))
            .skip_when(|c| !c.eval_enabled),
        Stage::new("rl-train", launch_module(config, "scripts.chat_rl", &[run_arg])).skip_when(|c| !c.rl_enabled),
        Stage::new(
            "rl-eval",
            launch_module(
                config,
                "scripts.chat_eval",
                &["-i".to_string(), "rl".to_string(), "-a".to_string(), "GSM8K".to_string()],
            ),
        )
        .skip_when(|c| !(c.rl_enabled && c.eval_enabled)),
    ]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip tool installs and environment provisioning; only activate what already exists.
    pub skip_bootstrap: bool,
}

/// Everything a finished run has to say.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub config: RunConfig,
    pub result: PipelineResult,
    /// Whether the final report was generated.
    pub report_generated: bool,
}

pub struct Speedrun {
    runner: Arc<dyn CommandRunner>,
    checker: Arc<dyn ToolChecker>,
    report: Arc<dyn ReportGenerator>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for Speedrun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Speedrun").finish_non_exhaustive()
    }
}

impl Speedrun {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        checker: Arc<dyn ToolChecker>,
        report: Arc<dyn ReportGenerator>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self { runner, checker, report, sink }
    }

    /// Applies file and built-in defaults, then freezes the configuration.
    ///
    /// Executes nothing, so it also backs `plan`.
    pub fn resolve_config(env: &mut EnvironmentManager, file: &ConfigFile) -> Result<RunConfig> {
        file.apply_defaults(env);
        apply_builtin_defaults(env);
        Ok(RunConfig::resolve(env, file)?)
    }

    /// Runs the whole pipeline.
    ///
    /// Fatal errors (bad configuration, report failures) come back as `Err`; a failing
    /// stage is a normal `Ok` outcome with a failed [`PipelineResult`].
    pub async fn execute(
        &self,
        mut env: EnvironmentManager,
        file: &ConfigFile,
        options: RunOptions,
    ) -> Result<RunOutcome> {
        // Bad settings abort here, before anything gets installed.
        let preliminary = Self::resolve_config(&mut env, file)?;
        env.ensure_directory(&preliminary.base_dir)?;

        if options.skip_bootstrap {
            info!("Skipping tool bootstrap");
            self.activate(&mut env);
        } else {
            self.bootstrap(&mut env, file).await;
        }

        let config = RunConfig::resolve(&env, file)?;
        let stages = speedrun_stages(&config);
        stage::validate(&stages)?;

        self.report.reset(&config).await?;

        let sequencer = StageSequencer::new(Arc::clone(&self.runner), Arc::clone(&self.sink));
        let mut result = sequencer.run(&stages, &config).await;

        let mut warnings = env.take_warnings();
        warnings.append(&mut result.warnings);
        result.warnings = warnings;

        let report_generated = if result.is_completed() {
            self.report.generate(&config).await?;
            true
        } else {
            false
        };

        Ok(RunOutcome { config, result, report_generated })
    }

    async fn bootstrap(&self, env: &mut EnvironmentManager, file: &ConfigFile) {
        let bootstrapper = ToolBootstrapper::new(Arc::clone(&self.checker), Arc::clone(&self.runner));

        bootstrapper.ensure_tool(&ToolRequirement::uv(), env).await;
        self.provision_environment(env, file).await;
        self.activate(env);
        bootstrapper.ensure_tool(&ToolRequirement::rust_toolchain(), env).await;
    }

    /// Creates the virtual environment when it does not exist yet.
    async fn provision_environment(&self, env: &mut EnvironmentManager, file: &ConfigFile) {
        let venv = env.project_dir().join(VENV_DIR);
        if venv.is_dir() {
            return;
        }

        let uv = file.tools.uv.clone().unwrap_or_else(|| "uv".to_string());
        let command = CommandSpec::new(uv, ["venv"]);
        info!(command = %command, "Creating isolated environment");

        let outcome = self.runner.run(&command, &env.process_env()).await;
        if !outcome.success() {
            let warning = BootstrapWarning::InstallFailure {
                tool: "virtual environment".to_string(),
                reason: outcome.to_string(),
            };
            warn!("{warning}");
            env.push_warning(warning);
        }
    }

    fn activate(&self, env: &mut EnvironmentManager) {
        let venv = env.project_dir().join(VENV_DIR);
        if let ExecutionContext::Isolated { root, .. } = env.activate_environment(&venv) {
            info!(venv = %root.display(), "Stages will run inside the isolated environment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MapEnvSource;

    fn config(pairs: &[(&str, &str)]) -> RunConfig {
        let mut env = EnvironmentManager::new(
            Box::new(MapEnvSource::from_pairs(pairs.iter().copied())),
            PathBuf::from("/work/nanochat"),
        );
        Speedrun::resolve_config(&mut env, &ConfigFile::default()).unwrap()
    }

    fn names(stages: &[Stage]) -> Vec<&str> {
        stages.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let stages = speedrun_stages(&config(&[]));
        assert_eq!(
            names(&stages),
            vec![
                "sync-dependencies",
                "build-tokenizer",
                "dataset-initial",
                "dataset-full",
                "tokenizer-train",
                "tokenizer-eval",
                "base-train",
                "base-loss",
                "base-eval",
                "identity-download",
                "mid-train",
                "mid-eval",
                "sft-train",
                "sft-eval",
                "rl-train",
                "rl-eval",
            ]
        );
        assert!(stage::validate(&stages).is_ok());
    }

    #[test]
    fn test_join_point_sits_between_tokenizer_and_pretraining() {
        let stages = speedrun_stages(&config(&[]));
        let spawn = stages.iter().position(|s| s.launch == stage::Launch::Background).unwrap();
        let join = stages.iter().position(|s| s.waits_for_background).unwrap();

        assert_eq!(stages[spawn].name, "dataset-full");
        assert_eq!(stages[join].name, "base-train");
        assert_eq!(stages[join - 1].name, "tokenizer-eval");
    }

    #[test]
    fn test_single_process_uses_interpreter() {
        let cfg = config(&[("WANDB_RUN", "d20")]);
        let cmd = launch_module(&cfg, "scripts.base_train", &["--depth=20".to_string(), "--run=d20".to_string()]);
        assert_eq!(cmd.to_string(), "python -m scripts.base_train --depth=20 --run=d20");
    }

    #[test]
    fn test_multi_process_uses_torchrun() {
        let cfg = config(&[("NPROC_PER_NODE", "8")]);

        let train = launch_module(&cfg, "scripts.mid_train", &["--run=dummy".to_string()]);
        assert_eq!(
            train.to_string(),
            "torchrun --standalone --nproc_per_node=8 -m scripts.mid_train -- --run=dummy"
        );

        let eval = launch_module(&cfg, "scripts.base_eval", &[]);
        assert_eq!(eval.to_string(), "torchrun --standalone --nproc_per_node=8 -m scripts.base_eval");
    }

    #[test]
    fn test_gates_follow_flags() {
        let defaults = config(&[]);
        let stages = speedrun_stages(&defaults);
        let skipped: Vec<&str> =
            stages.iter().filter(|s| s.is_skipped(&defaults)).map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["rl-train", "rl-eval"]);

        let no_loss = config(&[("NANOCHAT_RUN_LOSS", "0")]);
        let skipped: Vec<&str> =
            stages.iter().filter(|s| s.is_skipped(&no_loss)).map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["base-loss", "rl-train", "rl-eval"]);

        let rl_no_eval = config(&[("NANOCHAT_RUN_RL", "1"), ("NANOCHAT_RUN_EVAL", "0")]);
        let skipped: Vec<&str> =
            stages.iter().filter(|s| s.is_skipped(&rl_no_eval)).map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["base-loss", "base-eval", "mid-eval", "sft-eval", "rl-eval"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_identity_download_targets_base_dir() {
        let cfg = config(&[("NANOCHAT_BASE_DIR", "/data/nanochat")]);
        let stages = speedrun_stages(&cfg);
        let download = stages.iter().find(|s| s.name == "identity-download").unwrap();

        assert_eq!(download.command.program, "curl");
        assert!(download.command.args.contains(&"/data/nanochat/identity_conversations.jsonl".to_string()));
    }
}
