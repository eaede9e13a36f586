// src/cli/handlers/cancel.rs

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;

use crate::{
    CancellationToken,
    cli::handlers::commons,
    core::storage::RunJournal,
    models::RunnerKind,
    system::{backend::ExecutionBackend, executor},
};

#[derive(Parser, Debug)]
#[command(no_binary_name = true, about = "Stops every pending group of a run.")]
struct CancelArgs {
    experiment: String,
    run_id: u64,
}

/// Main entry point for the `cancel` command.
pub fn handle(args: Vec<String>, cancellation_token: &CancellationToken) -> Result<()> {
    let cancel_args = CancelArgs::try_parse_from(&args)?;
    let config = commons::load_project()?;
    let run_dir = commons::resolve_run_dir(&config, &cancel_args.experiment, cancel_args.run_id)?;

    let mut journal = RunJournal::open(&run_dir)?;
    let backend = commons::backend_for_record(journal.record(), cancellation_token);
    if !cancel_run(&mut journal, backend.as_ref())? {
        println!("Run {} has already ended.", cancel_args.run_id);
        return Ok(());
    }

    println!(
        "{} run {} of '{}'.",
        "Cancelled".yellow().bold(),
        cancel_args.run_id,
        cancel_args.experiment
    );
    Ok(())
}

/// Cancels the pending groups of a run. Returns `false` when every group had
/// already ended.
///
/// A local run is stopped by signalling the process that launched it, which
/// then records the cancellation itself. Remote runs are removed from the
/// scheduler and their pending groups are marked cancelled here.
pub fn cancel_run(journal: &mut RunJournal, backend: &dyn ExecutionBackend) -> Result<bool> {
    let run_id = journal.record().run_id;
    if journal.record().groups.iter().all(|g| g.status.is_terminal()) {
        return Ok(false);
    }

    backend
        .cancel(journal.record())
        .with_context(|| format!("Could not cancel run {}", run_id))?;

    let launcher_alive = journal.record().runner == RunnerKind::Local
        && journal
            .record()
            .main_pid
            .is_some_and(executor::is_process_alive);
    if !launcher_alive {
        journal.cancel_pending()?;
        journal.close_if_done()?;
    }
    Ok(true)
}
