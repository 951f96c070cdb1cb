//! Fail-fast stage sequencer.
//!
//! Stages run strictly in declaration order, one external process at a time. A stage whose
//! skip predicate holds is passed over without invoking anything. The first nonzero exit
//! halts the run: nothing after the failing stage is invoked, nothing is retried, and
//! nothing is rolled back.

use crate::background::{BackgroundTaskHandle, BackgroundTaskRunner};
use crate::config::RunConfig;
use crate::error::BootstrapWarning;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::runner::{CommandRunner, ExitOutcome};
use crate::stage::{Launch, Stage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Sequencer state. `Failed` and `Completed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum SequencerState {
    Idle,
    Running(usize),
    Skipped(usize),
    Failed(usize),
    Completed,
}

impl SequencerState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Completed)
    }

    /// Checks if the sequencer may move from `self` to `to`.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm is a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (*self, to) {
            // Start at the first stage, or finish an empty pipeline
            (Self::Idle, Self::Running(0) | Self::Skipped(0) | Self::Completed) => true,
            // A running stage either fails in place or hands over to the next one
            (Self::Running(i), Self::Failed(j)) => i == j,
            (Self::Running(i) | Self::Skipped(i), Self::Running(j) | Self::Skipped(j)) => j == i + 1,
            (Self::Running(_) | Self::Skipped(_), Self::Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageDisposition {
    Ran { outcome: ExitOutcome },
    Skipped,
    Spawned { task_id: String },
    Failed { outcome: ExitOutcome },
    /// Halted at the join point because the background stage failed; never invoked.
    BackgroundFailed { background: String, outcome: ExitOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub index: usize,
    pub name: String,
    pub disposition: StageDisposition,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every stage ran or was legitimately skipped.
    Completed,
    Failed { index: usize, stage: String, outcome: ExitOutcome },
    /// The background stage exited nonzero and was noticed when joining at `index`.
    BackgroundFailed { index: usize, joined_at: String, background: String, outcome: ExitOutcome },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub status: PipelineStatus,
    pub records: Vec<StageRecord>,
    pub warnings: Vec<BootstrapWarning>,
}

impl PipelineResult {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Name of the stage that halted the run, if any.
    pub fn failed_stage(&self) -> Option<&str> {
        match &self.status {
            PipelineStatus::Completed => None,
            PipelineStatus::Failed { stage, .. } => Some(stage),
            PipelineStatus::BackgroundFailed { background, .. } => Some(background),
        }
    }

    /// Status to propagate as the orchestrator's exit code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match &self.status {
            PipelineStatus::Completed => 0,
            PipelineStatus::Failed { outcome, .. } | PipelineStatus::BackgroundFailed { outcome, .. } => {
                match outcome.exit_code() {
                    0 => 1,
                    code => code,
                }
            }
        }
    }

    /// Names of stages whose command was actually invoked, in order.
    pub fn invoked(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| !matches!(r.disposition, StageDisposition::Skipped | StageDisposition::BackgroundFailed { .. }))
            .map(|r| r.name.as_str())
            .collect()
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| matches!(r.disposition, StageDisposition::Skipped))
            .map(|r| r.name.as_str())
            .collect()
    }
}

pub struct StageSequencer {
    runner: Arc<dyn CommandRunner>,
    background: BackgroundTaskRunner,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for StageSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSequencer").finish_non_exhaustive()
    }
}

/// Accumulates the run while the sequencer walks the stage list.
struct Walk {
    state: SequencerState,
    records: Vec<StageRecord>,
    warnings: Vec<BootstrapWarning>,
}

impl Walk {
    fn transition(&mut self, to: SequencerState) {
        if !self.state.can_transition_to(to) {
            error!(from = ?self.state, to = ?to, "Invalid sequencer transition");
        }
        debug_assert!(self.state.can_transition_to(to), "invalid transition {:?} -> {:?}", self.state, to);
        debug!(from = ?self.state, to = ?to, "Sequencer transition");
        self.state = to;
    }

    fn record(&mut self, index: usize, stage: &Stage, disposition: StageDisposition, started: Instant) {
        self.records.push(StageRecord {
            index,
            name: stage.name.clone(),
            disposition,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn finish(self, status: PipelineStatus) -> PipelineResult {
        PipelineResult { status, records: self.records, warnings: self.warnings }
    }
}

impl StageSequencer {
    pub fn new(runner: Arc<dyn CommandRunner>, sink: Arc<dyn ProgressSink>) -> Self {
        let background = BackgroundTaskRunner::new(Arc::clone(&runner));
        Self { runner, background, sink }
    }

    /// Runs `stages` in order under `config`.
    pub async fn run(&self, stages: &[Stage], config: &RunConfig) -> PipelineResult {
        self.run_with(stages, config, None).await
    }

    /// Like [`run`](Self::run), with a background unit that was spawned before the sequence.
    pub async fn run_with(
        &self,
        stages: &[Stage],
        config: &RunConfig,
        outstanding: Option<BackgroundTaskHandle>,
    ) -> PipelineResult {
        let mut walk = Walk { state: SequencerState::Idle, records: Vec::new(), warnings: Vec::new() };
        let mut slot = outstanding;

        for (index, stage) in stages.iter().enumerate() {
            let started = Instant::now();

            if stage.is_skipped(config) {
                walk.transition(SequencerState::Skipped(index));
                self.sink.on_event(ProgressEvent::StageSkipped { index, stage: stage.name.clone() });
                walk.record(index, stage, StageDisposition::Skipped, started);
                continue;
            }

            walk.transition(SequencerState::Running(index));

            if stage.waits_for_background {
                if let Some((background, outcome)) = self.join(stage, slot.take(), &mut walk.warnings).await {
                    if !outcome.success() {
                        return self.fail_background(walk, index, stage, background, outcome, started);
                    }
                }
            }

            match stage.launch {
                Launch::Background => {
                    let handle = self.background.spawn(
                        stage.name.clone(),
                        stage.command.clone(),
                        config.process_env().clone(),
                    );
                    let task_id = handle.id().to_string();
                    debug!(stage = %stage.name, command = %stage.command, "Background stage command");
                    self.sink.on_event(ProgressEvent::BackgroundSpawned {
                        stage: stage.name.clone(),
                        task_id: task_id.clone(),
                    });
                    walk.record(index, stage, StageDisposition::Spawned { task_id }, started);
                    if slot.replace(handle).is_some() {
                        warn!(stage = %stage.name, "Replaced an outstanding background unit that was never joined");
                    }
                }
                Launch::Foreground => {
                    debug!(stage = %stage.name, command = %stage.command, "Invoking stage command");
                    self.sink.on_event(ProgressEvent::StageStarted { index, stage: stage.name.clone() });

                    let outcome = self.runner.run(&stage.command, config.process_env()).await;
                    if !outcome.success() {
                        return self.fail(walk, index, stage, outcome, started);
                    }

                    self.sink.on_event(ProgressEvent::StageFinished {
                        index,
                        stage: stage.name.clone(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                    walk.record(index, stage, StageDisposition::Ran { outcome }, started);
                }
            }
        }

        if let Some(handle) = slot {
            warn!(task_id = %handle.id(), label = %handle.label(), "Background unit was never joined");
        }

        walk.transition(SequencerState::Completed);
        walk.finish(PipelineStatus::Completed)
    }

    /// Waits for the outstanding unit and returns its label and outcome. `None` means there
    /// was nothing to wait for.
    async fn join(
        &self,
        stage: &Stage,
        handle: Option<BackgroundTaskHandle>,
        warnings: &mut Vec<BootstrapWarning>,
    ) -> Option<(String, ExitOutcome)> {
        let Some(handle) = handle else {
            let warning = BootstrapWarning::BackgroundJoinFailure { stage: stage.name.clone() };
            warn!("{warning}");
            warnings.push(warning);
            return None;
        };

        let task_id = handle.id().to_string();
        if !handle.is_finished() {
            self.sink.on_event(ProgressEvent::BackgroundWaiting {
                stage: stage.name.clone(),
                task_id: task_id.clone(),
            });
        }

        let Some(outcome) = handle.join().await else {
            let warning = BootstrapWarning::BackgroundJoinFailure { stage: stage.name.clone() };
            warn!(label = %handle.label(), "{warning}");
            warnings.push(warning);
            return None;
        };

        self.sink.on_event(ProgressEvent::BackgroundJoined {
            stage: stage.name.clone(),
            task_id,
            outcome: outcome.clone(),
        });
        Some((handle.label().to_string(), outcome))
    }

    fn fail(
        &self,
        mut walk: Walk,
        index: usize,
        stage: &Stage,
        outcome: ExitOutcome,
        started: Instant,
    ) -> PipelineResult {
        walk.transition(SequencerState::Failed(index));
        self.sink.on_event(ProgressEvent::StageFailed {
            index,
            stage: stage.name.clone(),
            outcome: outcome.clone(),
        });
        walk.record(index, stage, StageDisposition::Failed { outcome: outcome.clone() }, started);
        walk.finish(PipelineStatus::Failed { index, stage: stage.name.clone(), outcome })
    }

    /// Halts at the join point `stage` on behalf of the failed background stage.
    fn fail_background(
        &self,
        mut walk: Walk,
        index: usize,
        stage: &Stage,
        background: String,
        outcome: ExitOutcome,
        started: Instant,
    ) -> PipelineResult {
        walk.transition(SequencerState::Failed(index));
        self.sink.on_event(ProgressEvent::BackgroundFailed {
            background: background.clone(),
            joined_at: stage.name.clone(),
            outcome: outcome.clone(),
        });
        walk.record(
            index,
            stage,
            StageDisposition::BackgroundFailed { background: background.clone(), outcome: outcome.clone() },
            started,
        );
        walk.finish(PipelineStatus::BackgroundFailed { index, joined_at: stage.name.clone(), background, outcome })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_from_idle() {
        let idle = SequencerState::Idle;
        assert!(idle.can_transition_to(SequencerState::Running(0)));
        assert!(idle.can_transition_to(SequencerState::Skipped(0)));
        assert!(idle.can_transition_to(SequencerState::Completed));
        assert!(!idle.can_transition_to(SequencerState::Running(1)));
        assert!(!idle.can_transition_to(SequencerState::Failed(0)));
    }

    #[test]
    fn test_transitions_advance_by_one() {
        assert!(SequencerState::Running(2).can_transition_to(SequencerState::Running(3)));
        assert!(SequencerState::Skipped(2).can_transition_to(SequencerState::Running(3)));
        assert!(SequencerState::Running(2).can_transition_to(SequencerState::Failed(2)));
        assert!(!SequencerState::Skipped(2).can_transition_to(SequencerState::Failed(2)));
        assert!(!SequencerState::Running(2).can_transition_to(SequencerState::Running(2)));
        assert!(!SequencerState::Running(2).can_transition_to(SequencerState::Skipped(5)));
    }

    #[test]
    fn test_terminal_states() {
        for state in [SequencerState::Completed, SequencerState::Failed(4)] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(SequencerState::Running(5)));
            assert!(!state.can_transition_to(SequencerState::Completed));
        }
        assert!(!SequencerState::Idle.is_terminal());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid transition")]
    fn test_walk_refuses_invalid_transition() {
        let mut walk = Walk { state: SequencerState::Idle, records: Vec::new(), warnings: Vec::new() };
        walk.transition(SequencerState::Running(3));
    }

    #[test]
    fn test_background_failure_reports_the_background_stage() {
        let result = PipelineResult {
            status: PipelineStatus::BackgroundFailed {
                index: 6,
                joined_at: "base-train".to_string(),
                background: "dataset-full".to_string(),
                outcome: ExitOutcome::Signaled,
            },
            records: Vec::new(),
            warnings: Vec::new(),
        };
        assert_eq!(result.failed_stage(), Some("dataset-full"));
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_exit_code_never_zero_on_failure() {
        let result = PipelineResult {
            status: PipelineStatus::Failed {
                index: 0,
                stage: "odd".to_string(),
                outcome: ExitOutcome::Exited(0),
            },
            records: Vec::new(),
            warnings: Vec::new(),
        };
        assert_eq!(result.exit_code(), 1);
        assert_eq!(result.failed_stage(), Some("odd"));
    }
}
