// src/system/backend.rs

//! # Execution Backends
//!
//! A backend takes the jobs of a run and dispatches them: local processes,
//! HTCondor clusters or Slurm jobs. It is chosen once, when the run is
//! created, and later answers status and cancellation queries for it.

use crate::{
    CancellationToken,
    constants::{STDERR_FILENAME, STDOUT_FILENAME},
    core::{command_builder::BuiltCommand, templates::SubmitTemplate},
    models::{ExecutionHandle, GroupRecord, GroupStatus, RunRecord, RunnerKind},
    system::{
        executor::ExecutionError, htcondor::HtcondorBackend, local::LocalBackend,
        slurm::SlurmBackend,
    },
};
use std::fmt;
use std::path::PathBuf;

/// One unit of work handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    pub index: usize,
    pub command: BuiltCommand,
    pub working_dir: PathBuf,
    pub group_dir: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl DispatchJob {
    pub fn new(index: usize, command: BuiltCommand, working_dir: PathBuf, group_dir: PathBuf) -> Self {
        Self {
            index,
            command,
            working_dir,
            stdout: group_dir.join(STDOUT_FILENAME),
            stderr: group_dir.join(STDERR_FILENAME),
            group_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handed to a scheduler; completion is observed later.
    Dispatched(ExecutionHandle),
    /// Ran to a terminal state before `dispatch` returned.
    Completed {
        handle: Option<ExecutionHandle>,
        status: GroupStatus,
    },
    Failed(String),
}

impl DispatchOutcome {
    pub fn status(&self) -> GroupStatus {
        match self {
            Self::Dispatched(_) => GroupStatus::Running,
            Self::Completed { status, .. } => *status,
            Self::Failed(_) => GroupStatus::Failed,
        }
    }
}

/// Receives lifecycle events while a backend dispatches.
pub trait DispatchObserver {
    fn started(&mut self, index: usize, handle: &ExecutionHandle);
    fn finished(&mut self, index: usize, status: GroupStatus, error: Option<&str>);
}

pub trait ExecutionBackend: fmt::Debug {
    fn kind(&self) -> RunnerKind;

    /// Dispatches every job, reporting events to `observer`. Returns one
    /// outcome per job, in job order. A single job failing does not stop
    /// the others.
    fn dispatch(
        &self,
        jobs: &[DispatchJob],
        observer: &mut dyn DispatchObserver,
    ) -> Result<Vec<DispatchOutcome>, ExecutionError>;

    /// Current status of `group`, read from the backend's own artifacts.
    fn query_status(&self, group: &GroupRecord, run: &RunRecord) -> GroupStatus;

    fn cancel(&self, run: &RunRecord) -> Result<(), ExecutionError>;
}

/// Everything needed to build a backend.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub threads: usize,
    pub template: SubmitTemplate,
    pub batch_name: String,
    pub show_progress: bool,
    pub cancellation_token: CancellationToken,
}

pub fn create_backend(kind: RunnerKind, options: BackendOptions) -> Box<dyn ExecutionBackend> {
    match kind {
        RunnerKind::Local => Box::new(LocalBackend::new(
            options.threads,
            options.cancellation_token,
            options.show_progress,
        )),
        RunnerKind::Htcondor => Box::new(HtcondorBackend::new(options.template, options.batch_name)),
        RunnerKind::Slurm => Box::new(SlurmBackend::new(options.template, options.batch_name)),
    }
}

/// Observer that keeps every event, in order.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub started: Vec<(usize, ExecutionHandle)>,
    pub finished: Vec<(usize, GroupStatus)>,
}

#[cfg(test)]
impl DispatchObserver for RecordingObserver {
    fn started(&mut self, index: usize, handle: &ExecutionHandle) {
        self.started.push((index, handle.clone()));
    }

    fn finished(&mut self, index: usize, status: GroupStatus, _error: Option<&str>) {
        self.finished.push((index, status));
    }
}
