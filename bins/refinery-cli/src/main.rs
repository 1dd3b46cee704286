mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "refinery-cli")]
#[command(about = "Refinery CLI - Set up runs, check datasets, execute programs and read reports", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the project layout and a default run configuration
    Init {
        /// Project path
        #[arg(short, long, default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing config/refinery.json
        #[arg(long, default_value = "false")]
        force: bool,
    },

    /// Validate the run configuration and inspect the dataset
    Check {
        /// Run configuration file
        #[arg(short, long, env = "REFINERY_CONFIG", default_value = "config/refinery.json")]
        config: PathBuf,

        /// Dataset override
        #[arg(short, long, env = "REFINERY_DATASET")]
        dataset: Option<PathBuf>,
    },

    /// Run a program file over a dataset in the sandbox and score it
    Exec {
        /// JavaScript program (plain or a Markdown reply with a code fence)
        #[arg(short, long)]
        program: PathBuf,

        /// Run configuration file
        #[arg(short, long, env = "REFINERY_CONFIG", default_value = "config/refinery.json")]
        config: PathBuf,

        /// Dataset override
        #[arg(short, long, env = "REFINERY_DATASET")]
        dataset: Option<PathBuf>,

        /// Per-record timeout override in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Worker count override
        #[arg(short, long)]
        workers: Option<usize>,

        /// Number of failures to print
        #[arg(long, default_value = "5")]
        show_failures: usize,

        /// Write the full batch report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Render the metrics and summary of a finished run
    Report {
        /// Run directory (output/<timestamp>)
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { path, force } => {
            commands::init_project(&path, force)?;
        }
        Commands::Check { config, dataset } => {
            commands::check(&config, dataset).await?;
        }
        Commands::Exec {
            program,
            config,
            dataset,
            timeout_ms,
            workers,
            show_failures,
            output,
        } => {
            let options = commands::ExecOptions {
                timeout_ms,
                workers,
                show_failures,
                output,
            };
            commands::exec_program(&program, &config, dataset, options).await?;
        }
        Commands::Report { dir } => {
            commands::print_report(&dir)?;
        }
    }

    Ok(())
}
