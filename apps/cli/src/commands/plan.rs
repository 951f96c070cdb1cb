//! Plan command implementation.
//!
//! Resolves configuration exactly as `run` would and lists the stages, without
//! installing or executing anything.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use speedrun_core::stage::validate;
use speedrun_core::{speedrun_stages, ConfigFile, EnvironmentManager, Launch, RunConfig, Speedrun, Stage};
use std::path::PathBuf;

pub fn execute(project_dir: PathBuf, file: &ConfigFile, json_output: bool) -> Result<()> {
    let mut env = EnvironmentManager::from_process(project_dir);
    let config = Speedrun::resolve_config(&mut env, file)?;
    let stages = speedrun_stages(&config);
    validate(&stages)?;

    if json_output {
        let entries: Vec<_> = stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                json!({
                    "index": index,
                    "name": stage.name,
                    "command": stage.command.to_string(),
                    "skipped": stage.is_skipped(&config),
                    "background": stage.launch == Launch::Background,
                    "waits_for_background": stage.waits_for_background,
                })
            })
            .collect();
        let out = json!({ "config": config, "stages": entries });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_config(&config);
    print_stages(&stages, &config);
    Ok(())
}

fn print_config(config: &RunConfig) {
    let flag = |on: bool| if on { "on".green() } else { "off".dimmed() };

    println!();
    println!("{}", "Configuration".bold().cyan());
    println!();
    println!("  Base dir:   {}", config.base_dir.display().to_string().dimmed());
    println!("  Run:        {}", config.run_id.cyan());
    println!("  Processes:  {}", config.nproc_per_node);
    println!("  Threads:    {}", config.omp_num_threads);
    println!("  Evaluation: {}", flag(config.eval_enabled));
    println!("  Loss eval:  {}", flag(config.loss_enabled));
    println!("  RL:         {}", flag(config.rl_enabled));
    println!("  Depth:      {}", config.training.depth);
    println!();
}

fn print_stages(stages: &[Stage], config: &RunConfig) {
    println!("{}", format!("Stages ({})", stages.len()).bold().cyan());
    println!();

    for (index, stage) in stages.iter().enumerate() {
        let mut name = stage.name.normal();
        let mut notes = Vec::new();
        if stage.is_skipped(config) {
            name = name.dimmed();
            notes.push("skipped");
        }
        if stage.launch == Launch::Background {
            notes.push("background");
        }
        if stage.waits_for_background {
            notes.push("waits for background");
        }

        let notes = if notes.is_empty() { String::new() } else { format!("[{}]", notes.join(", ")) };
        println!("  {:>2}. {:<20} {}", index + 1, name, notes.yellow());
        println!("      {}", stage.command.to_string().dimmed());
    }
    println!();
}
