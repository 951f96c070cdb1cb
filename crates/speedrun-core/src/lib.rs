//! Speedrun Core
//!
//! Single-host orchestration for the chat model training speedrun:
//! - Applying configuration defaults without clobbering user overrides (`EnvironmentManager`)
//! - Making sure external tools exist before first use (`ToolBootstrapper`)
//! - Running the one background dataset download (`BackgroundTaskRunner`)
//! - Walking the fixed stage list, fail-fast (`StageSequencer`)
//! - Bracketing the run with report reset/generate (`ReportGenerator`)

pub mod background;
pub mod bootstrap;
pub mod config;
pub mod environment;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod runner;
pub mod sequencer;
pub mod stage;

pub use background::{BackgroundTaskHandle, BackgroundTaskRunner};
pub use bootstrap::{EnsureOutcome, InstallCapability, SystemToolChecker, ToolBootstrapper, ToolChecker, ToolRequirement};
pub use config::{ConfigFile, RunConfig};
pub use environment::{EnvSource, EnvironmentManager, ExecutionContext, MapEnvSource, ProcessEnvSource};
pub use error::{BootstrapWarning, ConfigError, Result, SpeedrunError};
pub use pipeline::{speedrun_stages, RunOptions, RunOutcome, Speedrun};
pub use progress::{ProgressEvent, ProgressSink, RecordingProgressSink, TracingProgressSink};
pub use report::{CommandReportGenerator, ReportGenerator};
pub use runner::{CommandRunner, CommandSpec, ExitOutcome, ProcessEnv, ProcessRunner};
pub use sequencer::{PipelineResult, PipelineStatus, SequencerState, StageDisposition, StageRecord, StageSequencer};
pub use stage::{Launch, Stage};
