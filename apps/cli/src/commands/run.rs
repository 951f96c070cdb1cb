//! Run command implementation.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use speedrun_core::{
    CommandReportGenerator, CommandRunner, ConfigFile, EnvironmentManager, PipelineStatus, ProcessRunner,
    RunOptions, RunOutcome, Speedrun, StageDisposition, SystemToolChecker, TracingProgressSink,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Executes the pipeline and returns the process exit code.
pub async fn execute(project_dir: PathBuf, file: &ConfigFile, skip_bootstrap: bool, json_output: bool) -> Result<i32> {
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let speedrun = Speedrun::new(
        Arc::clone(&runner),
        Arc::new(SystemToolChecker),
        Arc::new(CommandReportGenerator::new(runner)),
        Arc::new(TracingProgressSink),
    );

    let env = EnvironmentManager::from_process(project_dir);
    let outcome = speedrun.execute(env, file, RunOptions { skip_bootstrap }).await?;

    if json_output {
        print_json(&outcome)?;
    } else {
        print_summary(&outcome);
    }

    Ok(outcome.result.exit_code())
}

fn print_json(outcome: &RunOutcome) -> Result<()> {
    let out = json!({
        "config": outcome.config,
        "status": outcome.result.status,
        "exit_code": outcome.result.exit_code(),
        "stages": outcome.result.records,
        "warnings": outcome.result.warnings,
        "report_generated": outcome.report_generated,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn print_summary(outcome: &RunOutcome) {
    let result = &outcome.result;

    println!();
    println!("{}", "Speedrun Summary".bold().cyan());
    println!();
    println!("  Run:      {}", outcome.config.run_id.cyan());
    println!("  Base dir: {}", outcome.config.base_dir.display().to_string().dimmed());
    println!();

    println!("{:<4} {:<20} {:<10} {}", "#", "Stage", "Status", "Elapsed");
    println!("{}", "─".repeat(50));
    for record in &result.records {
        let status = match &record.disposition {
            StageDisposition::Ran { .. } => "ok".green(),
            StageDisposition::Skipped => "skipped".dimmed(),
            StageDisposition::Spawned { .. } => "spawned".cyan(),
            StageDisposition::Failed { .. } => "failed".red(),
            StageDisposition::BackgroundFailed { .. } => "blocked".red(),
        };
        let elapsed = match record.disposition {
            StageDisposition::Skipped
            | StageDisposition::Spawned { .. }
            | StageDisposition::BackgroundFailed { .. } => String::new(),
            _ => format_elapsed(record.elapsed_ms),
        };
        println!("{:<4} {:<20} {:<10} {}", record.index + 1, record.name, status, elapsed.dimmed());
    }
    println!();

    if !result.warnings.is_empty() {
        println!("{}", format!("Warnings ({})", result.warnings.len()).bold().yellow());
        for warning in &result.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
        println!();
    }

    match &result.status {
        PipelineStatus::Completed => {
            println!("{}", "✓ All stages completed".green().bold());
            if outcome.report_generated {
                println!("  Report: {}", outcome.config.base_dir.join("report").display().to_string().dimmed());
            }
        }
        PipelineStatus::Failed { stage, outcome: exit, .. } => {
            println!("{}", format!("✗ Stage '{}' failed ({})", stage, exit).red().bold());
            println!("  {}", "Later stages were not run and the report was not generated.".dimmed());
        }
        PipelineStatus::BackgroundFailed { background, joined_at, outcome: exit, .. } => {
            println!("{}", format!("✗ Background stage '{}' failed ({})", background, exit).red().bold());
            println!(
                "  {}",
                format!("Stopped before '{}'; the report was not generated.", joined_at).dimmed()
            );
        }
    }
}

fn format_elapsed(ms: u64) -> String {
    let secs = ms / 1000;
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}.{:01}s", secs, (ms % 1000) / 100)
    }
}
