//! kssh - Distributed Work Dispatcher
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use kssh::config::{CliArgs, DispatchConfig, InputMode};
use kssh::dispatch::Dispatcher;
use kssh::summary::{print_header, print_summary};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    let config = DispatchConfig::from_args(args).context("Invalid configuration")?;

    let show_summary = config.show_summary;
    if show_summary {
        let mode = match config.input_mode {
            InputMode::Lines => format!("lines (blocksize {})", config.blocksize),
            InputMode::Files => format!("files ({} inputs)", config.input_files.len()),
        };
        let output = config
            .output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "stdout".to_string());
        print_header(&mode, config.machines.len(), &config.task, &output);
    }

    let dispatcher = Dispatcher::new(config).context("Failed to set up dispatch")?;
    let result = dispatcher.run().context("Dispatch failed")?;

    if show_summary {
        print_summary(&result);
    }

    // Blocks lost to excluded workers are reported, not fatal.
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("kssh=info,warn")
    } else {
        EnvFilter::new("kssh=warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
