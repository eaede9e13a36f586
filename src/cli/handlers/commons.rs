// src/cli/handlers/commons.rs

// Shared helpers for the command handlers.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use crate::{
    CancellationToken,
    core::{
        config_loader::ProjectConfig,
        paths,
        storage::{self, StorageError},
    },
    models::RunRecord,
    system::backend::{self, BackendOptions, ExecutionBackend},
};

/// Loads the configuration of the project enclosing the current directory.
pub fn load_project() -> Result<ProjectConfig> {
    let cwd = env::current_dir().context("Could not read the current directory")?;
    ProjectConfig::discover(&cwd).context("Could not load the project configuration")
}

/// `<result_dir>/<experiment>` of a configured experiment.
pub fn experiment_dir(config: &ProjectConfig, experiment: &str) -> Result<PathBuf> {
    config.experiment(experiment)?;
    let result_dir = config.result_dir_path()?;
    Ok(paths::experiment_dir(&result_dir, experiment))
}

/// The directory of an existing run.
pub fn resolve_run_dir(config: &ProjectConfig, experiment: &str, run_id: u64) -> Result<PathBuf> {
    let run_dir = paths::run_dir(&experiment_dir(config, experiment)?, run_id);
    if !run_dir.is_dir() {
        return Err(StorageError::RunNotFound {
            experiment: experiment.to_string(),
            run_id,
        }
        .into());
    }
    Ok(run_dir)
}

/// Loads the record of an existing run.
pub fn load_run(config: &ProjectConfig, experiment: &str, run_id: u64) -> Result<RunRecord> {
    let run_dir = resolve_run_dir(config, experiment, run_id)?;
    storage::load_run_record(&run_dir)
        .with_context(|| format!("Could not read the record of run {}", run_id))
}

/// Rebuilds the backend a run was dispatched with, for status and cancel.
pub fn backend_for_record(record: &RunRecord, cancellation_token: &CancellationToken) -> Box<dyn ExecutionBackend> {
    backend::create_backend(
        record.runner,
        BackendOptions {
            threads: record.runner_settings.threads.unwrap_or(1),
            template: Default::default(),
            batch_name: batch_name(&record.experiment, record.run_id),
            show_progress: false,
            cancellation_token: cancellation_token.clone(),
        },
    )
}

/// Name under which the jobs of a run are submitted to a scheduler.
pub fn batch_name(experiment: &str, run_id: u64) -> String {
    format!("{}_run_{}", experiment, run_id)
}
