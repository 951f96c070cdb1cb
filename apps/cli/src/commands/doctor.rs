//! Doctor command implementation.
//!
//! Reports what a run would find on this host: configuration, the isolated
//! environment, bootstrap-managed tools and the programs stages invoke.

use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use speedrun_core::bootstrap::detection::find_executable;
use speedrun_core::config::ToolPrograms;
use speedrun_core::environment::activation_paths;
use speedrun_core::pipeline::VENV_DIR;
use speedrun_core::{
    ConfigFile, EnvironmentManager, InstallCapability, RunConfig, Speedrun, SystemToolChecker, ToolChecker,
    ToolRequirement,
};
use std::path::PathBuf;

/// A tool the bootstrapper knows how to install.
struct ManagedTool {
    name: String,
    location: Option<PathBuf>,
    install: InstallCapability,
}

/// A program invoked directly by stages.
struct StageProgram {
    role: &'static str,
    program: String,
    location: Option<PathBuf>,
}

struct Findings {
    config: std::result::Result<RunConfig, String>,
    venv: PathBuf,
    venv_ready: bool,
    tools: Vec<ManagedTool>,
    programs: Vec<StageProgram>,
}

pub fn execute(project_dir: PathBuf, file: &ConfigFile, json_output: bool) -> Result<()> {
    let findings = inspect(project_dir, file);
    if json_output { print_json(&findings) } else { print_human(&findings) }
}

fn inspect(project_dir: PathBuf, file: &ConfigFile) -> Findings {
    let mut env = EnvironmentManager::from_process(project_dir);
    let config = Speedrun::resolve_config(&mut env, file).map_err(|e| e.to_string());

    let venv = env.project_dir().join(VENV_DIR);
    let (script, _) = activation_paths(&venv);
    let venv_ready = script.is_file();
    if venv_ready {
        env.activate_environment(&venv);
    }

    let search_path = env.search_path();
    let checker = SystemToolChecker;
    let tools = [ToolRequirement::uv(), ToolRequirement::rust_toolchain()]
        .into_iter()
        .map(|req| ManagedTool {
            location: find_executable(&req.binary, &search_path),
            install: checker.capability(&req, &search_path),
            name: req.name,
        })
        .collect();

    let names = config.as_ref().map_or_else(|_| ToolPrograms::default(), |c| c.tools.clone());
    let programs = [("interpreter", names.python), ("launcher", names.torchrun), ("downloader", names.curl)]
        .into_iter()
        .map(|(role, program)| StageProgram { role, location: find_executable(&program, &search_path), program })
        .collect();

    Findings { config, venv, venv_ready, tools, programs }
}

fn print_human(findings: &Findings) -> Result<()> {
    println!("{}", "Speedrun Doctor - Host Validation".bold().cyan());
    println!();

    let mut all_ok = true;

    println!("{}", "Configuration:".bold());
    match &findings.config {
        Ok(config) => {
            println!("  Status: {}", "✓ Valid".green());
            println!("  Base dir: {}", config.base_dir.display().to_string().dimmed());
            println!("  Run: {}", config.run_id.cyan());
            println!("  Processes per node: {}", config.nproc_per_node);
        }
        Err(e) => {
            println!("  Status: {}", format!("✗ {}", e).red());
            all_ok = false;
        }
    }
    println!();

    println!("{}", "Environment:".bold());
    if findings.venv_ready {
        println!("  Status: {}", "✓ Isolated environment found".green());
    } else {
        println!("  Status: {}", "⚠ No isolated environment yet".yellow());
        println!("  {}", "Note: `speedrun run` creates it during bootstrap".dimmed());
    }
    println!("  Location: {}", findings.venv.display().to_string().dimmed());
    println!();

    println!("{}", "Managed Tools:".bold());
    for tool in &findings.tools {
        match &tool.location {
            Some(path) => {
                println!("  {} {}: {}", "✓".green(), tool.name.cyan(), path.display().to_string().dimmed());
            }
            None => {
                let how = match tool.install {
                    InstallCapability::Native => "missing, will install with the platform package manager".yellow(),
                    InstallCapability::ShellFallback => "missing, will install with the shell installer".yellow(),
                    InstallCapability::Unavailable => {
                        all_ok = false;
                        "missing, no install mechanism available".red()
                    }
                };
                println!("  {} {}: {}", "⚠".yellow(), tool.name.cyan(), how);
            }
        }
    }
    println!();

    println!("{}", "Stage Programs:".bold());
    for program in &findings.programs {
        match &program.location {
            Some(path) => println!(
                "  {} {} ({}): {}",
                "✓".green(),
                program.program.cyan(),
                program.role,
                path.display().to_string().dimmed()
            ),
            None => {
                println!("  {} {} ({}): {}", "✗".red(), program.program.cyan(), program.role, "not found".red());
                all_ok = false;
            }
        }
    }
    println!();

    if all_ok {
        println!("{}", "✓ All checks passed!".green().bold());
    } else {
        println!("{}", "⚠ Some issues found - see above".yellow().bold());
    }

    Ok(())
}

fn print_json(findings: &Findings) -> Result<()> {
    let config = match &findings.config {
        Ok(config) => json!({ "status": "ok", "resolved": config }),
        Err(e) => json!({ "status": "error", "error": e }),
    };
    let tools: Vec<_> = findings
        .tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "path": t.location.as_ref().map(|p| p.display().to_string()),
                "install": t.install,
            })
        })
        .collect();
    let programs: Vec<_> = findings
        .programs
        .iter()
        .map(|p| {
            json!({
                "role": p.role,
                "program": p.program,
                "path": p.location.as_ref().map(|l| l.display().to_string()),
            })
        })
        .collect();

    let out = json!({
        "config": config,
        "environment": {
            "path": findings.venv.display().to_string(),
            "ready": findings.venv_ready,
        },
        "tools": tools,
        "programs": programs,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
