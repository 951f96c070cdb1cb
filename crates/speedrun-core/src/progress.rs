use crate::runner::ExitOutcome;
use serde::Serialize;
use std::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StageStarted { index: usize, stage: String },
    StageSkipped { index: usize, stage: String },
    StageFinished { index: usize, stage: String, elapsed_ms: u64 },
    StageFailed { index: usize, stage: String, outcome: ExitOutcome },
    BackgroundSpawned { stage: String, task_id: String },
    BackgroundWaiting { stage: String, task_id: String },
    BackgroundJoined { stage: String, task_id: String, outcome: ExitOutcome },
    /// The background unit exited nonzero; `joined_at` never ran.
    BackgroundFailed { background: String, joined_at: String, outcome: ExitOutcome },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::StageStarted { index, stage } => info!(index, stage = %stage, "Stage started"),
            ProgressEvent::StageSkipped { index, stage } => info!(index, stage = %stage, "Stage skipped"),
            ProgressEvent::StageFinished { index, stage, elapsed_ms } => {
                info!(index, stage = %stage, elapsed_ms, "Stage finished");
            }
            ProgressEvent::StageFailed { index, stage, outcome } => {
                error!(index, stage = %stage, outcome = %outcome, "Stage failed");
            }
            ProgressEvent::BackgroundSpawned { stage, task_id } => {
                info!(stage = %stage, task_id = %task_id, "Background unit spawned");
            }
            ProgressEvent::BackgroundWaiting { stage, task_id } => {
                info!(stage = %stage, task_id = %task_id, "Waiting for background unit");
            }
            ProgressEvent::BackgroundJoined { stage, task_id, outcome } => {
                info!(stage = %stage, task_id = %task_id, outcome = %outcome, "Background unit joined");
            }
            ProgressEvent::BackgroundFailed { background, joined_at, outcome } => {
                error!(stage = %background, joined_at = %joined_at, outcome = %outcome, "Background stage failed");
            }
        }
    }
}

/// Keeps events in memory, for tests and JSON summaries.
#[derive(Debug, Default)]
pub struct RecordingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgressSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for RecordingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
