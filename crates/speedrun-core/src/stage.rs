//! Declarative stage records.

use crate::config::RunConfig;
use crate::error::{Result, SpeedrunError};
use crate::runner::CommandSpec;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Decides from the config whether a stage is skipped.
pub type SkipPredicate = Arc<dyn Fn(&RunConfig) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Launch {
    /// Block until the command exits.
    Foreground,
    /// Start the command and move on; joined later by a stage that waits for it.
    Background,
}

#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub command: CommandSpec,
    pub skip: Option<SkipPredicate>,
    pub launch: Launch,
    /// Join the outstanding background unit before running this stage.
    pub waits_for_background: bool,
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("has_skip", &self.skip.is_some())
            .field("launch", &self.launch)
            .field("waits_for_background", &self.waits_for_background)
            .finish()
    }
}

impl Stage {
    pub fn new(name: impl Into<String>, command: CommandSpec) -> Self {
        Self {
            name: name.into(),
            command,
            skip: None,
            launch: Launch::Foreground,
            waits_for_background: false,
        }
    }

    #[must_use]
    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RunConfig) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn in_background(mut self) -> Self {
        self.launch = Launch::Background;
        self
    }

    #[must_use]
    pub fn after_background(mut self) -> Self {
        self.waits_for_background = true;
        self
    }

    pub fn is_skipped(&self, config: &RunConfig) -> bool {
        self.skip.as_ref().is_some_and(|predicate| predicate(config))
    }
}

/// Checks the structural rules of a stage list.
///
/// Names are unique, there is at most one background stage and at most one join stage,
/// and a join stage only appears after the background stage it waits for.
pub fn validate(stages: &[Stage]) -> Result<()> {
    let mut names = HashSet::new();
    let mut background: Option<usize> = None;
    let mut join: Option<usize> = None;

    for (index, stage) in stages.iter().enumerate() {
        if !names.insert(stage.name.as_str()) {
            return Err(SpeedrunError::InvalidPipeline(format!("duplicate stage name '{}'", stage.name)));
        }

        if stage.launch == Launch::Background {
            if background.replace(index).is_some() {
                return Err(SpeedrunError::InvalidPipeline(format!(
                    "stage '{}' is a second background stage",
                    stage.name
                )));
            }
            if stage.waits_for_background {
                return Err(SpeedrunError::InvalidPipeline(format!(
                    "background stage '{}' cannot also wait for the background unit",
                    stage.name
                )));
            }
        }

        if stage.waits_for_background {
            if join.replace(index).is_some() {
                return Err(SpeedrunError::InvalidPipeline(format!(
                    "stage '{}' is a second join point",
                    stage.name
                )));
            }
            if background.is_none() {
                return Err(SpeedrunError::InvalidPipeline(format!(
                    "stage '{}' waits for a background unit that is never spawned before it",
                    stage.name
                )));
            }
        }
    }

    Ok(())
}
