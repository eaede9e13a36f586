// src/cli/handlers/status.rs

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;

use crate::{
    CancellationToken,
    cli::handlers::commons,
    core::{config_loader::ProjectConfig, progress::StatusReport, storage},
    models::{GroupStatus, RunRecord},
    system::backend::ExecutionBackend,
};

#[derive(Parser, Debug)]
#[command(
    no_binary_name = true,
    about = "Shows the runs of an experiment, or the groups of one run."
)]
struct StatusArgs {
    experiment: String,

    /// Run to inspect. Without it, every run of the experiment is listed.
    run_id: Option<u64>,

    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

/// Main entry point for the `status` command.
pub fn handle(args: Vec<String>, cancellation_token: &CancellationToken) -> Result<()> {
    let status_args = StatusArgs::try_parse_from(&args)?;
    let config = commons::load_project()?;

    match status_args.run_id {
        Some(run_id) => {
            let record = commons::load_run(&config, &status_args.experiment, run_id)?;
            let report = build_report(&record, cancellation_token);
            if status_args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render_table());
            }
        }
        None => {
            let reports = experiment_reports(&config, &status_args.experiment, cancellation_token)?;
            if status_args.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else if reports.is_empty() {
                println!("{}", "No runs yet.".dimmed());
            } else {
                println!(
                    "{}",
                    format!("{:>5}  {:<12} {:>7}  {:<9} {}", "run", "status", "progress", "runner", "description")
                        .bold()
                );
                for report in &reports {
                    println!("{}", report.summary_line());
                }
            }
        }
    }
    Ok(())
}

/// Queries the backend of the run for the live status of every group.
pub fn build_report(record: &RunRecord, cancellation_token: &CancellationToken) -> StatusReport {
    let backend = commons::backend_for_record(record, cancellation_token);
    let statuses = query_statuses(backend.as_ref(), record);
    StatusReport::new(record, &statuses)
}

fn query_statuses(backend: &dyn ExecutionBackend, record: &RunRecord) -> Vec<GroupStatus> {
    record
        .groups
        .iter()
        .map(|group| backend.query_status(group, record))
        .collect()
}

/// Reports of every run of `experiment`, in id order. Unreadable runs are
/// skipped with a warning.
fn experiment_reports(
    config: &ProjectConfig,
    experiment: &str,
    cancellation_token: &CancellationToken,
) -> Result<Vec<StatusReport>> {
    let experiment_dir = commons::experiment_dir(config, experiment)?;
    let runs = storage::list_runs(&experiment_dir)
        .with_context(|| format!("Could not list the runs of '{}'", experiment))?;

    let mut reports = Vec::with_capacity(runs.len());
    for (run_id, run_dir) in runs {
        match storage::load_run_record(&run_dir) {
            Ok(record) => reports.push(build_report(&record, cancellation_token)),
            Err(e) => log::warn!("Skipping run {}: {}", run_id, e),
        }
    }
    Ok(reports)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::{ExecutionHandle, GroupRecord, RunnerKind, RunnerSettings};
    use chrono::Local;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn local_record(run_dir: &std::path::Path, main_pid: u32) -> RunRecord {
        let group = |index: usize, status: GroupStatus| GroupRecord {
            index,
            storage_path: run_dir.join(format!("group_{}", index)),
            command: "run.sh".to_string(),
            status,
            handle: Some(ExecutionHandle::Process { pid: 1 }),
            started: Some(Local::now()),
            finished: None,
            error: None,
        };
        RunRecord {
            run_id: 1,
            experiment: "gaussian".to_string(),
            description: String::new(),
            tags: vec![],
            launched: Local::now(),
            ended: None,
            runner: RunnerKind::Local,
            runner_settings: RunnerSettings::default(),
            container: None,
            commit: None,
            storage_path: run_dir.to_path_buf(),
            working_directory: run_dir.to_path_buf(),
            main_pid: Some(main_pid),
            groups: vec![group(0, GroupStatus::Finished), group(1, GroupStatus::Running)],
        }
    }

    #[test]
    fn test_running_group_of_a_dead_launcher_reads_cancelled() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        // Above any Linux or macOS pid_max, so never a live process.
        let dead_pid = u32::try_from(i32::MAX).unwrap();
        let record = local_record(dir.path(), dead_pid);
        let token = Arc::new(AtomicBool::new(false));

        // --- Execute ---
        let report = build_report(&record, &token);

        // --- Assert ---
        let statuses: Vec<GroupStatus> = report.groups.iter().map(|g| g.status).collect();
        assert_eq!(statuses, vec![GroupStatus::Finished, GroupStatus::Cancelled]);
        assert_eq!(report.status, GroupStatus::Cancelled);
    }

    #[test]
    fn test_running_group_of_a_live_launcher_stays_running() {
        let dir = tempdir().unwrap();
        let record = local_record(dir.path(), std::process::id());
        let report = build_report(&record, &Arc::new(AtomicBool::new(false)));
        assert_eq!(report.groups[1].status, GroupStatus::Running);
        assert_eq!(report.status, GroupStatus::Running);
    }
}
