//! mikroscope, the log sidecar.
//!
//! Durable NDJSON ingest, a queryable SQLite index, retention
//! maintenance, and webhook alerting behind a small HTTP API.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mikroscope_logging::{default_log_dir, init_logging, LogConfig};

mod config;

#[derive(Parser, Debug)]
#[command(name = "mikroscope", about = "Log sidecar: NDJSON ingest, index, retention, alerting")]
struct Cli {
    /// Verbose console logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sidecar
    Serve {
        #[command(flatten)]
        args: config::ServeArgs,
    },

    /// Print the resolved configuration (secrets masked)
    Config {
        #[command(flatten)]
        args: config::ServeArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            ExitCode::from(1)
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Serve { args } => {
            let resolved = config::resolve(&args)?;
            let log_dir = default_log_dir(&resolved.db_path);
            let _guard = init_logging(LogConfig {
                app_name: "mikroscope",
                log_dir: Some(&log_dir),
                verbose: cli.verbose,
            })?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build tokio runtime")?;
            runtime.block_on(mikroscope_server::run(resolved))
        }
        Commands::Config { args, json } => {
            let resolved = config::resolve(&args)?;
            print!("{}", config::render(&resolved, json));
            Ok(())
        }
    }
}
