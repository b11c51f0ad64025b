//! Test Runner Hook
//!
//! A Claude Code PostToolUse hook that runs the project's tests in the
//! background after file edits, at most one run at a time per project.

#![forbid(unsafe_code)]

mod hook;
mod runner;
mod status;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, warn};
use trh_common::LogConfig;
use trh_common::config::{EnvError, EnvParser};

#[derive(Parser)]
#[command(name = "trh")]
#[command(author, version, about = "Test Runner Hook - background tests after agent edits")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle a PostToolUse hook invocation (default)
    Hook,

    /// Run the test command for a handed-off trigger
    #[command(hide = true)]
    Run {
        /// Project directory the run belongs to
        #[arg(long)]
        project_dir: PathBuf,

        /// Tool that triggered the run
        #[arg(long)]
        tool: Option<String>,

        /// File that triggered the run
        #[arg(long)]
        file: Option<String>,
    },

    /// Show configuration, lock state, and the last run
    Status {
        /// Project directory (defaults to the current directory)
        #[arg(short, long)]
        project_dir: Option<PathBuf>,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Show recent test runs
    History {
        /// Project directory (defaults to the current directory)
        #[arg(short, long)]
        project_dir: Option<PathBuf>,

        /// Number of records to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Hook) {
        // Hook and runner always exit 0: failures are visible only in the logs.
        Commands::Hook => {
            let (result, _logging) = hook::run_hook().await;
            match result {
                Ok(outcome) => debug!("Hook finished: {:?}", outcome),
                Err(e) => warn!("Hook failed: {:#}", e),
            }
            Ok(())
        }
        Commands::Run {
            project_dir,
            tool,
            file,
        } => {
            let _logging = runner::run_detached(runner::RunArgs {
                project_dir,
                tool_name: tool,
                file_path: file,
            })
            .await;
            Ok(())
        }
        Commands::Status { project_dir, json } => {
            let _logging = init_stderr_logging();
            status::status(project_dir, json)
        }
        Commands::History {
            project_dir,
            limit,
            json,
        } => {
            let _logging = init_stderr_logging();
            status::history(project_dir, limit, json)
        }
    }
}

/// Interactive subcommands stay quiet unless asked otherwise.
const STDERR_LOG_LEVEL: &str = "warn";

fn init_stderr_logging() -> Option<trh_common::LoggingGuard> {
    let (level, warnings) = stderr_log_level(EnvParser::new());
    let guard = trh_common::init_logging(&LogConfig::new(level).with_stderr()).ok();
    for warning in &warnings {
        warn!("{}", warning);
    }
    guard
}

fn stderr_log_level(mut parser: EnvParser) -> (String, Vec<EnvError>) {
    let level = parser.get_log_level("LOG_LEVEL", STDERR_LOG_LEVEL).value;
    (level, parser.take_errors())
}
