mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use std::process::ExitCode;
use tickguard_core::{telemetry, TickguardConfig};

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, CliError> {
    let cli = Cli::parse();

    let config = TickguardConfig::load_or_default(cli.config.as_deref())?;
    telemetry::init(&cli.log_directive(&config.logging.level), cli.log_format());

    let envelope = commands::run(&cli, &config).await?;
    output::render(&envelope, cli.format, cli.pretty)?;

    Ok(ExitCode::from(envelope.meta.outcome.exit_code()))
}
