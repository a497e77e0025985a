mod cli;
mod commands;
mod error;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::error::CliError;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

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

    let outcome = commands::run(&cli).await?;
    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&outcome.output)?
    } else {
        serde_json::to_string(&outcome.output)?
    };
    println!("{rendered}");

    if let Some(failure) = outcome.failure {
        return Err(failure);
    }
    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr so stdout carries only the JSON envelope.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
