//! Configuration file loading.

use anyhow::Context;
use speedrun_core::ConfigFile;
use std::path::Path;

/// Loads the configuration file layer.
///
/// Precedence, highest first:
/// 1. Process environment (applied later, never overwritten)
/// 2. `--config <path>`, or else `./speedrun.toml` over `~/.speedrun/config.toml`
/// 3. Built-in defaults
pub fn load(explicit: Option<&Path>, project_dir: &Path) -> anyhow::Result<ConfigFile> {
    match explicit {
        Some(path) => ConfigFile::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => ConfigFile::discover_and_load(project_dir).context("Failed to load configuration"),
    }
}
