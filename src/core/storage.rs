// src/core/storage.rs

//! # Storage Allocator
//!
//! Owns the on-disk layout of runs:
//!
//! ```text
//! <result_dir>/<experiment>/
//!     .run_counter            last allocated run id
//!     run_<id>/
//!         info.yaml           run record
//!         group_info.yaml     (single group) or group_<i>/group_info.yaml
//!         stdout.txt, stderr.txt, progress.txt
//! ```
//!
//! Run directories are never overwritten and never deleted by qanat.

use crate::{
    constants::{GROUP_INFO_FILENAME, RUN_COUNTER_FILENAME, RUN_INFO_FILENAME},
    core::paths,
    models::{ExecutionHandle, GroupInfo, GroupStatus, RunRecord},
    system::backend::DispatchObserver,
};
use chrono::Local;
use serde::{Serialize, de::DeserializeOwned};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Run directory '{0}' already exists.")]
    RunExists(String),
    #[error("A run needs at least one group.")]
    EmptyRun,
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid metadata in '{path}': {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Run counter '{0}' is corrupted.")]
    CorruptCounter(String),
    #[error("Run {run_id} of experiment '{experiment}' does not exist.")]
    RunNotFound { experiment: String, run_id: u64 },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

// --- RUN IDS & LAYOUT ---

/// Allocates the next run id of an experiment.
///
/// Ids are strictly increasing: the counter is never decremented, even when
/// run directories are removed, and ids whose directory already exists are
/// skipped.
pub fn allocate_run_id(experiment_dir: &Path) -> Result<u64, StorageError> {
    fs::create_dir_all(experiment_dir).map_err(io_error(experiment_dir))?;
    let next = peek_run_id(experiment_dir)?;
    let counter_path = experiment_dir.join(RUN_COUNTER_FILENAME);
    fs::write(&counter_path, next.to_string()).map_err(io_error(&counter_path))?;
    log::debug!("Allocated run id {} in '{}'.", next, experiment_dir.display());
    Ok(next)
}

/// The id the next allocation would return, without reserving it.
pub fn peek_run_id(experiment_dir: &Path) -> Result<u64, StorageError> {
    let counter_path = experiment_dir.join(RUN_COUNTER_FILENAME);
    let last = match fs::read_to_string(&counter_path) {
        Ok(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| StorageError::CorruptCounter(counter_path.display().to_string()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(io_error(&counter_path)(e)),
    };

    let highest_existing = list_runs(experiment_dir)?
        .last()
        .map_or(0, |(id, _)| *id);
    let mut next = last.max(highest_existing) + 1;
    while paths::run_dir(experiment_dir, next).exists() {
        next += 1;
    }
    Ok(next)
}

/// Creates the run directory and returns one storage directory per group.
///
/// A single group stores directly in the run directory; several groups get
/// `group_<i>` subdirectories.
pub fn create_run_layout(run_dir: &Path, group_count: usize) -> Result<Vec<PathBuf>, StorageError> {
    if group_count == 0 {
        return Err(StorageError::EmptyRun);
    }
    if run_dir.exists() {
        return Err(StorageError::RunExists(run_dir.display().to_string()));
    }
    if let Some(parent) = run_dir.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    // `create_dir` (not `create_dir_all`) fails if another process won the race.
    fs::create_dir(run_dir).map_err(|e| match e.kind() {
        std::io::ErrorKind::AlreadyExists => StorageError::RunExists(run_dir.display().to_string()),
        _ => io_error(run_dir)(e),
    })?;

    let dirs = group_dirs(run_dir, group_count);
    if group_count > 1 {
        for dir in &dirs {
            fs::create_dir(dir).map_err(io_error(dir))?;
        }
    }
    Ok(dirs)
}

/// Storage directories of the groups of a run, without creating them.
pub fn group_dirs(run_dir: &Path, group_count: usize) -> Vec<PathBuf> {
    if group_count == 1 {
        return vec![run_dir.to_path_buf()];
    }
    (0..group_count)
        .map(|index| run_dir.join(paths::group_dir_name(index)))
        .collect()
}

/// Lists the `run_<id>` directories of an experiment, sorted by id.
pub fn list_runs(experiment_dir: &Path) -> Result<Vec<(u64, PathBuf)>, StorageError> {
    if !experiment_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut runs: Vec<(u64, PathBuf)> = fs::read_dir(experiment_dir)
        .map_err(io_error(experiment_dir))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let id = paths::parse_run_dir_name(&entry.file_name().to_string_lossy())?;
            Some((id, entry.path()))
        })
        .collect();
    runs.sort_by_key(|(id, _)| *id);
    Ok(runs)
}

// --- METADATA FILES ---

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let yaml = serde_yaml::to_string(value).map_err(|e| StorageError::Metadata {
        path: path.display().to_string(),
        source: e,
    })?;
    // Written next to the target and renamed so readers never see half a file.
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, yaml).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let content = fs::read_to_string(path).map_err(io_error(path))?;
    serde_yaml::from_str(&content).map_err(|e| StorageError::Metadata {
        path: path.display().to_string(),
        source: e,
    })
}

pub fn write_group_info(group_dir: &Path, info: &GroupInfo) -> Result<(), StorageError> {
    write_yaml(&group_dir.join(GROUP_INFO_FILENAME), info)
}

pub fn read_group_info(group_dir: &Path) -> Result<GroupInfo, StorageError> {
    read_yaml(&group_dir.join(GROUP_INFO_FILENAME))
}

pub fn load_run_record(run_dir: &Path) -> Result<RunRecord, StorageError> {
    read_yaml(&run_dir.join(RUN_INFO_FILENAME))
}

// --- RUN JOURNAL ---

/// The persisted record of one run. Every mutation is written to `info.yaml`
/// immediately.
#[derive(Debug)]
pub struct RunJournal {
    path: PathBuf,
    record: RunRecord,
}

impl RunJournal {
    /// Creates the journal of a new run and writes it.
    pub fn create(record: RunRecord) -> Result<Self, StorageError> {
        let journal = Self {
            path: record.storage_path.join(RUN_INFO_FILENAME),
            record,
        };
        journal.persist()?;
        Ok(journal)
    }

    pub fn open(run_dir: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            path: run_dir.join(RUN_INFO_FILENAME),
            record: load_run_record(run_dir)?,
        })
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Applies `change` to the record and persists it.
    pub fn update(&mut self, change: impl FnOnce(&mut RunRecord)) -> Result<(), StorageError> {
        change(&mut self.record);
        self.persist()
    }

    fn persist(&self) -> Result<(), StorageError> {
        write_yaml(&self.path, &self.record)
    }

    /// Marks every group that has not reached a terminal state as cancelled.
    pub fn cancel_pending(&mut self) -> Result<(), StorageError> {
        let now = Local::now();
        self.update(|record| {
            for group in record.groups.iter_mut().filter(|g| !g.status.is_terminal()) {
                group.status = GroupStatus::Cancelled;
                group.finished = Some(now);
            }
        })
    }

    /// Records the end of the run if every group is terminal.
    pub fn close_if_done(&mut self) -> Result<(), StorageError> {
        if self.record.groups.iter().all(|g| g.status.is_terminal()) && self.record.ended.is_none() {
            self.update(|record| record.ended = Some(Local::now()))?;
        }
        Ok(())
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            log::warn!("Could not update run record: {}", e);
        }
    }
}

impl DispatchObserver for RunJournal {
    fn started(&mut self, index: usize, handle: &ExecutionHandle) {
        if let Some(group) = self.record.groups.iter_mut().find(|g| g.index == index) {
            group.status = GroupStatus::Running;
            group.handle = Some(handle.clone());
            group.started = Some(Local::now());
        }
        self.persist_or_warn();
    }

    fn finished(&mut self, index: usize, status: GroupStatus, error: Option<&str>) {
        if let Some(group) = self.record.groups.iter_mut().find(|g| g.index == index) {
            group.status = status;
            group.finished = Some(Local::now());
            group.error = error.map(str::to_string);
        }
        self.persist_or_warn();
    }
}
