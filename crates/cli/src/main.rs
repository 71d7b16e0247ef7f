//! Release watcher CLI entry point.
//!
//! This binary is the composition root. Responsibilities:
//!
//! 1. **Parse configuration**: flags with environment fallbacks, validated
//!    into [`config::Settings`] before any I/O.
//! 2. **Wire observability**: `tracing-subscriber` to stderr (text or JSON),
//!    plus an OpenTelemetry OTLP exporter when one is configured.
//! 3. **Construct infrastructure**: `GithubClient` for both the release
//!    fetcher and the build trigger, `FileWatermarkStore` for state, injected
//!    into `DispatchEngine`.
//! 4. **Map the outcome to an exit code**: `0` triggered or no-op, `1` failed
//!    run, `2` configuration or persistence failure.

mod commands;
mod config;
mod observability;

use std::process::ExitCode;

use clap::Parser;
use watcher::{RunMode, StoreError, WatcherError};

use crate::config::{Cli, Command, Settings};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = match observability::init(cli.global.log_format) {
        Ok(telemetry) => telemetry,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(2);
        }
    };

    let code = match execute(&cli).await {
        Ok(output) => {
            println!("{}", output.text);
            output.exit_code
        }
        Err(err) => {
            tracing::error!(error = %err, "command failed");
            eprintln!("error: {err}");
            error_exit_code(&err)
        }
    };

    telemetry.shutdown();
    ExitCode::from(code as u8)
}

async fn execute(cli: &Cli) -> Result<commands::Output, WatcherError> {
    let settings = Settings::from_args(&cli.global)?;
    let json = cli.global.json;

    match &cli.command {
        Command::Run(args) => commands::watch(&settings, args, RunMode::Dispatch, json).await,
        Command::Check(args) => commands::watch(&settings, args, RunMode::DryRun, json).await,
        Command::Status => commands::status(&settings, json).await,
        Command::Reset { to } => commands::reset(&settings, to.as_deref(), json).await,
    }
}

/// A held lock is a contended run, not a broken store.
fn error_exit_code(err: &WatcherError) -> i32 {
    match err {
        WatcherError::Persistence(StoreError::Locked { .. }) => 1,
        WatcherError::ConfigurationError { .. } | WatcherError::Persistence(_) => 2,
    }
}
