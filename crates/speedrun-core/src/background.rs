//! The single fire-and-forget background unit.
//!
//! `spawn` starts the work on the tokio runtime and returns at once. The outcome is
//! published on a watch channel, so [`BackgroundTaskHandle::join`] returns immediately
//! (and repeatably) once the unit has finished. There is no cancellation: the unit runs to
//! completion or until the host process exits.

use crate::runner::{CommandRunner, CommandSpec, ExitOutcome, ProcessEnv};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct BackgroundTaskHandle {
    id: Uuid,
    label: String,
    spawned_at: DateTime<Utc>,
    outcome: watch::Receiver<Option<ExitOutcome>>,
}

impl BackgroundTaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    /// Blocks until the unit terminates and returns its outcome.
    ///
    /// Returns immediately when the unit already finished. `None` means the unit vanished
    /// without reporting (its task panicked or the runtime dropped it).
    pub async fn join(&self) -> Option<ExitOutcome> {
        let mut rx = self.outcome.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        }
    }
}

pub struct BackgroundTaskRunner {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for BackgroundTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTaskRunner").finish_non_exhaustive()
    }
}

impl BackgroundTaskRunner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Starts `command` concurrently with the caller.
    pub fn spawn(&self, label: impl Into<String>, command: CommandSpec, env: ProcessEnv) -> BackgroundTaskHandle {
        let runner = Arc::clone(&self.runner);
        spawn_with(label, async move { runner.run(&command, &env).await })
    }
}

/// Runs any future as the background unit. Must be called inside a tokio runtime.
pub fn spawn_with<F>(label: impl Into<String>, work: F) -> BackgroundTaskHandle
where
    F: Future<Output = ExitOutcome> + Send + 'static,
{
    let (tx, rx) = watch::channel(None);
    let id = Uuid::new_v4();
    let label = label.into();

    debug!(task_id = %id, label = %label, "Spawning background unit");
    tokio::spawn(async move {
        let outcome = work.await;
        // Nobody listening is fine; the handle may have been dropped.
        let _ = tx.send(Some(outcome));
    });

    BackgroundTaskHandle { id, label, spawned_at: Utc::now(), outcome: rx }
}
