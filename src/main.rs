mod cli;
mod config;
mod dispatch;
mod error;
mod library;
mod matcher;
mod notify;
mod nyaa;
mod reconcile;
mod torrent;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt, prelude::*};

use crate::cli::{Cli, CommandError};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::reconcile::RunStage;

fn setup_logging() -> Result<()> {
    let data_dir = config::data_dir().map_err(|_| Error::NoDataDir)?;
    std::fs::create_dir_all(&data_dir)?;

    let file_appender = tracing_appender::rolling::daily(&data_dir, "tsuzuki.log");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tsuzuki=info"));

    // Runs unattended from cron: problems also go to stderr so they reach the mail
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .init();

    Ok(())
}

fn exit_code(error: &Error) -> ExitCode {
    match error {
        Error::AlreadyRunning(_) => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = setup_logging();
    if let Err(e) = &logging {
        eprintln!("Warning: Could not set up logging: {}", e);
    }
    let report = |message: &str, e: &dyn std::fmt::Display| {
        if logging.is_ok() {
            error!(error = %e, "{}", message);
        } else {
            eprintln!("{}: {}", message, e);
        }
    };

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            report("Could not load config", &e);
            return exit_code(&e);
        }
    };
    info!(base_dir = %config.base_dir().display(), "Loaded config");

    match cli::execute(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CommandError::Run(failure)) => {
            error!(stage = %failure.stage, state = %RunStage::Errored, "Pass aborted");
            report("Reconciliation failed", &failure);
            exit_code(&failure.error)
        }
        Err(CommandError::Other(e)) => {
            report("Command failed", &e);
            exit_code(&e)
        }
    }
}
