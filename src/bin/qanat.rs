// src/bin/qanat.rs

use qanat::{
    cli::{Cli, dispatcher},
    system::executor::ExecutionError,
};
use clap::Parser;
use colored::*;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Sets up logging, dispatches the command and turns errors into exit codes.
fn main() {
    let cancellation_token = Arc::new(AtomicBool::new(false));
    env_logger::init();

    let cli = Cli::parse();
    log::debug!("CLI args parsed: {:?}", cli);

    if let Err(e) = dispatcher::dispatch(cli.args, &cancellation_token) {
        // Argument errors and `--help` of a command are rendered by clap.
        if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
            clap_err.exit();
        }
        // An interrupted run exits like an interrupted shell command.
        if matches!(e.downcast_ref::<ExecutionError>(), Some(ExecutionError::Cancelled)) {
            std::process::exit(130);
        }

        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}
