// src/system/local.rs

//! # Local Backend
//!
//! Runs the groups of a run as child processes of qanat itself, either one
//! after the other or on a bounded `rayon` pool. Workers only run processes;
//! every event is sent back over a channel to the dispatching thread, which
//! alone updates the observer and the progress bar.

use crate::{
    CancellationToken,
    models::{ExecutionHandle, GroupRecord, GroupStatus, RunRecord, RunnerKind},
    system::{
        backend::{DispatchJob, DispatchObserver, DispatchOutcome, ExecutionBackend},
        executor::{self, ExecutionError},
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::mpsc;

#[derive(Debug)]
enum WorkerEvent {
    Started { index: usize, pid: u32 },
    Finished { index: usize, outcome: DispatchOutcome },
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    threads: usize,
    token: CancellationToken,
    show_progress: bool,
}

impl LocalBackend {
    pub fn new(threads: usize, token: CancellationToken, show_progress: bool) -> Self {
        Self {
            threads: threads.max(1),
            token,
            show_progress,
        }
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} groups {msg}",
        )
        .map(|s| s.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar
    }

    fn dispatch_sequential(
        &self,
        jobs: &[DispatchJob],
        observer: &mut dyn DispatchObserver,
        bar: &ProgressBar,
    ) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            let outcome = run_job(job, &self.token, |pid| {
                observer.started(job.index, &ExecutionHandle::Process { pid });
            });
            report_finished(observer, job.index, &outcome);
            bar.inc(1);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn dispatch_pool(
        &self,
        jobs: &[DispatchJob],
        observer: &mut dyn DispatchObserver,
        bar: &ProgressBar,
    ) -> Result<Vec<DispatchOutcome>, ExecutionError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("qanat-worker-{}", i))
            .build()
            .map_err(|e| ExecutionError::Pool(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<WorkerEvent>();
        for job in jobs.iter().cloned() {
            let tx = tx.clone();
            let token = self.token.clone();
            pool.spawn(move || {
                let index = job.index;
                let started_tx = tx.clone();
                let outcome = run_job(&job, &token, |pid| {
                    let _ = started_tx.send(WorkerEvent::Started { index, pid });
                });
                let _ = tx.send(WorkerEvent::Finished { index, outcome });
            });
        }
        drop(tx);

        let mut outcomes: Vec<Option<DispatchOutcome>> = vec![None; jobs.len()];
        let positions: Vec<usize> = jobs.iter().map(|j| j.index).collect();
        for event in rx {
            match event {
                WorkerEvent::Started { index, pid } => {
                    log::trace!("Group {} started with pid {}.", index, pid);
                    observer.started(index, &ExecutionHandle::Process { pid });
                }
                WorkerEvent::Finished { index, outcome } => {
                    report_finished(observer, index, &outcome);
                    bar.inc(1);
                    if let Some(slot) = positions
                        .iter()
                        .position(|i| *i == index)
                        .and_then(|pos| outcomes.get_mut(pos))
                    {
                        *slot = Some(outcome);
                    }
                }
            }
        }

        Ok(outcomes
            .into_iter()
            .map(|o| o.unwrap_or_else(|| DispatchOutcome::Failed("worker exited without reporting".to_string())))
            .collect())
    }
}

/// Runs one job to completion. `on_start` is called with the child's pid.
fn run_job(
    job: &DispatchJob,
    token: &CancellationToken,
    on_start: impl FnOnce(u32),
) -> DispatchOutcome {
    if executor::check_for_cancellation(token).is_err() {
        return DispatchOutcome::Completed {
            handle: None,
            status: GroupStatus::Cancelled,
        };
    }

    let mut child = match executor::spawn_to_files(
        job.command.argv(),
        &job.working_dir,
        &job.stdout,
        &job.stderr,
    ) {
        Ok(child) => child,
        Err(e) => return DispatchOutcome::Failed(e.to_string()),
    };
    let pid = child.id();
    on_start(pid);
    let handle = Some(ExecutionHandle::Process { pid });

    match executor::wait_with_cancellation(&mut child, token) {
        Ok(status) if status.success() => DispatchOutcome::Completed {
            handle,
            status: GroupStatus::Finished,
        },
        Ok(status) => {
            log::debug!("Group {} exited with {}.", job.index, status);
            DispatchOutcome::Completed {
                handle,
                status: GroupStatus::Failed,
            }
        }
        Err(ExecutionError::Cancelled) => DispatchOutcome::Completed {
            handle,
            status: GroupStatus::Cancelled,
        },
        Err(e) => DispatchOutcome::Failed(e.to_string()),
    }
}

fn report_finished(observer: &mut dyn DispatchObserver, index: usize, outcome: &DispatchOutcome) {
    match outcome {
        DispatchOutcome::Failed(reason) => {
            log::warn!("Group {} could not be run: {}", index, reason);
            observer.finished(index, GroupStatus::Failed, Some(reason));
        }
        other => observer.finished(index, other.status(), None),
    }
}

impl ExecutionBackend for LocalBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn dispatch(
        &self,
        jobs: &[DispatchJob],
        observer: &mut dyn DispatchObserver,
    ) -> Result<Vec<DispatchOutcome>, ExecutionError> {
        log::debug!(
            "Running {} group(s) locally with {} worker(s).",
            jobs.len(),
            self.threads
        );
        let bar = self.progress_bar(jobs.len());
        let outcomes = if self.threads <= 1 || jobs.len() <= 1 {
            self.dispatch_sequential(jobs, observer, &bar)
        } else {
            self.dispatch_pool(jobs, observer, &bar)?
        };
        bar.finish_and_clear();

        executor::check_for_cancellation(&self.token)?;
        Ok(outcomes)
    }

    /// Terminal statuses are final. A non-terminal group whose dispatching
    /// process is gone was interrupted.
    fn query_status(&self, group: &GroupRecord, run: &RunRecord) -> GroupStatus {
        if group.status.is_terminal() {
            return group.status;
        }
        match run.main_pid {
            Some(pid) if executor::is_process_alive(pid) => group.status,
            _ => GroupStatus::Cancelled,
        }
    }

    fn cancel(&self, run: &RunRecord) -> Result<(), ExecutionError> {
        match run.main_pid {
            Some(pid) if executor::is_process_alive(pid) => {
                log::debug!("Sending SIGTERM to run process {}.", pid);
                executor::terminate_process(pid)
            }
            _ => {
                log::debug!("Run {} has no live process to signal.", run.run_id);
                Ok(())
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::command_builder::{CommandContext, build_command};
    use crate::core::expander;
    use crate::system::backend::RecordingObserver;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    /// Builds jobs running `sh -c <script>` with the storage path appended.
    fn jobs(root: &Path, scripts: &[&str]) -> Vec<DispatchJob> {
        scripts
            .iter()
            .enumerate()
            .map(|(index, script)| {
                let group_dir = root.join(format!("group_{}", index));
                std::fs::create_dir_all(&group_dir).unwrap();
                let ctx = CommandContext::new(
                    "sh -c",
                    PathBuf::from(*script),
                    vec![],
                    root.to_path_buf(),
                    root.to_path_buf(),
                )
                .unwrap();
                let set = expander::parse_cli_tokens::<&str>(&[], 0).unwrap();
                DispatchJob::new(index, build_command(&set, &group_dir, &ctx), root.to_path_buf(), group_dir)
            })
            .collect()
    }

    fn token() -> CancellationToken {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_sequential_runs_in_order_and_reports_failures() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        let jobs = jobs(dir.path(), &["echo first", "exit 4", "echo third"]);
        let backend = LocalBackend::new(1, token(), false);
        let mut observer = RecordingObserver::default();

        // --- Execute ---
        let outcomes = backend.dispatch(&jobs, &mut observer).unwrap();

        // --- Assert ---
        let statuses: Vec<GroupStatus> = outcomes.iter().map(DispatchOutcome::status).collect();
        assert_eq!(statuses, vec![GroupStatus::Finished, GroupStatus::Failed, GroupStatus::Finished]);
        let order: Vec<usize> = observer.finished.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(observer.started.len(), 3);
        assert_eq!(std::fs::read_to_string(&jobs[0].stdout).unwrap(), "first\n");
    }

    #[test]
    fn test_pool_returns_outcomes_in_job_order() {
        let dir = tempdir().unwrap();
        let jobs = jobs(dir.path(), &["sleep 0.3; exit 0", "exit 1", "exit 0", "sleep 0.1"]);
        let backend = LocalBackend::new(2, token(), false);
        let mut observer = RecordingObserver::default();

        let outcomes = backend.dispatch(&jobs, &mut observer).unwrap();

        let statuses: Vec<GroupStatus> = outcomes.iter().map(DispatchOutcome::status).collect();
        assert_eq!(
            statuses,
            vec![GroupStatus::Finished, GroupStatus::Failed, GroupStatus::Finished, GroupStatus::Finished]
        );
        assert_eq!(observer.finished.len(), 4);
    }

    #[test]
    fn test_spawn_failure_is_a_failed_group() {
        let dir = tempdir().unwrap();
        let mut jobs = jobs(dir.path(), &["exit 0"]);
        jobs[0].working_dir = dir.path().join("missing");
        let backend = LocalBackend::new(1, token(), false);

        let outcomes = backend.dispatch(&jobs, &mut RecordingObserver::default()).unwrap();
        assert!(matches!(outcomes[0], DispatchOutcome::Failed(_)));
    }

    #[test]
    fn test_cancelled_token_marks_groups_cancelled() {
        let dir = tempdir().unwrap();
        let jobs = jobs(dir.path(), &["exit 0", "exit 0"]);
        let token = token();
        token.store(true, Ordering::SeqCst);
        let backend = LocalBackend::new(1, token, false);
        let mut observer = RecordingObserver::default();

        let result = backend.dispatch(&jobs, &mut observer);

        assert!(matches!(result, Err(ExecutionError::Cancelled)));
        assert!(observer.started.is_empty());
        assert!(observer.finished.iter().all(|(_, s)| *s == GroupStatus::Cancelled));
    }
}
