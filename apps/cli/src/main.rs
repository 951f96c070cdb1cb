//! Speedrun CLI - drives the chat model training speedrun on a single host.
//!
//! `speedrun run` bootstraps the toolchain and walks every stage from tokenizer
//! training to the final report. `plan` and `doctor` inspect without executing.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{doctor, plan, run};

#[derive(Parser, Debug)]
#[command(
    name = "speedrun",
    author,
    version,
    about = "Train a small chat model end to end on one host",
    long_about = "Runs the full training pipeline (tokenizer, pretraining, midtraining, SFT, optional RL) in a fixed order.\nSettings come from the environment first, then speedrun.toml, then built-in defaults."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Project directory holding the training scripts (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    project_dir: Option<PathBuf>,

    /// Configuration file to use instead of the discovered ones
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline
    ///
    /// Installs missing tools, resets the report, runs every stage in order and
    /// generates the report. The process exits with the failing stage's status.
    Run {
        /// Only activate an existing environment; never install anything
        #[arg(long)]
        skip_bootstrap: bool,

        /// Print a JSON summary instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the resolved configuration and the stage list without running anything
    Plan {
        #[arg(long)]
        json: bool,
    },

    /// Check which tools are available and how missing ones would be installed
    Doctor {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Logs go to stderr so --json output stays parseable.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let file = config::load(args.config.as_deref(), &project_dir)?;

    let exit_code = match args.command {
        Command::Run { skip_bootstrap, json } => run::execute(project_dir, &file, skip_bootstrap, json).await?,
        Command::Plan { json } => {
            plan::execute(project_dir, &file, json)?;
            0
        }
        Command::Doctor { json } => {
            doctor::execute(project_dir, &file, json)?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
