// src/system/slurm.rs

//! # Slurm Backend
//!
//! Writes one `slurm_job.sh` per group and submits it with `sbatch`. The job
//! script appends lifecycle markers to `slurm_events.txt`, which is where
//! status is read from.

use crate::{
    constants::{SLURM_EVENTS_FILENAME, SLURM_SCRIPT_FILENAME},
    core::templates::SubmitTemplate,
    models::{ExecutionHandle, GroupRecord, GroupStatus, RunRecord, RunnerKind},
    system::{
        backend::{DispatchJob, DispatchObserver, DispatchOutcome, ExecutionBackend},
        executor::{self, ExecutionError},
        shell_quote, write_job_script,
    },
};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt::Write;
use std::fs;

lazy_static! {
    static ref PARSABLE_RE: Regex = Regex::new(r"^\s*(\d+)(?:;\S+)?\s*$").unwrap();
    static ref SUBMITTED_RE: Regex = Regex::new(r"Submitted batch job (\d+)").unwrap();
    static ref EXIT_CODE_RE: Regex = Regex::new(r"^exit_code=(-?\d+)\s*$").unwrap();
}

#[derive(Debug, Clone)]
pub struct SlurmBackend {
    template: SubmitTemplate,
    batch_name: String,
    submit_command: Vec<String>,
    cancel_command: Vec<String>,
}

impl SlurmBackend {
    pub fn new(template: SubmitTemplate, batch_name: String) -> Self {
        Self {
            template,
            batch_name,
            submit_command: vec!["sbatch".to_string(), "--parsable".to_string()],
            cancel_command: vec!["scancel".to_string()],
        }
    }

    pub fn with_commands(mut self, submit: Vec<String>, cancel: Vec<String>) -> Self {
        self.submit_command = submit;
        self.cancel_command = cancel;
        self
    }

    /// Renders the job script of one group.
    pub fn job_script(&self, job: &DispatchJob) -> String {
        let events = shell_quote(&job.group_dir.join(SLURM_EVENTS_FILENAME));
        let mut out = String::from("#!/bin/bash\n");
        let _ = writeln!(out, "#SBATCH --job-name={}_{}", self.batch_name, job.index);
        let _ = writeln!(out, "#SBATCH --output={}", job.stdout.display());
        let _ = writeln!(out, "#SBATCH --error={}", job.stderr.display());
        for (key, value) in &self.template.directives {
            let _ = writeln!(out, "#SBATCH {}", render_directive(key, value));
        }
        let _ = writeln!(out, "\necho started >> {}", events);
        let _ = writeln!(out, "cd {}", shell_quote(&job.working_dir));
        let _ = writeln!(out, "{}", job.command.command_line());
        out.push_str("code=$?\n");
        let _ = writeln!(out, "echo \"exit_code=$code\" >> {}", events);
        out.push_str("exit $code\n");
        out
    }

    fn submit(&self, job: &DispatchJob) -> Result<String, ExecutionError> {
        let script_path = job.group_dir.join(SLURM_SCRIPT_FILENAME);
        write_job_script(&script_path, &self.job_script(job))?;

        let mut argv = self.submit_command.clone();
        argv.push(script_path.display().to_string());
        let output = executor::execute_and_capture_output(&argv, &job.group_dir)?;
        parse_job_id(&output).ok_or_else(|| ExecutionError::UnexpectedOutput {
            command: self.submit_command.join(" "),
            output: output.trim().to_string(),
        })
    }
}

/// Short keys (`-N`, or a bare single letter) render as `-N value`; long keys
/// render as `--key=value`.
pub fn render_directive(key: &str, value: &str) -> String {
    let name = key.trim_start_matches('-');
    let is_short = name.chars().count() == 1 && !key.starts_with("--");
    if is_short {
        format!("-{} {}", name, value)
    } else {
        format!("--{}={}", name, value)
    }
}

/// Reads the job id from `sbatch --parsable` (`<id>` or `<id>;<cluster>`) or
/// from the plain `Submitted batch job <id>` message.
pub fn parse_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| PARSABLE_RE.captures(line))
        .or_else(|| SUBMITTED_RE.captures(output))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Derives a group status from the markers written by the job script and
/// the job's stderr.
pub fn status_from_markers(events: &str, stderr: &str) -> GroupStatus {
    let exit_code = events
        .lines()
        .filter_map(|line| EXIT_CODE_RE.captures(line))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<i64>().ok())
        .last();
    match exit_code {
        Some(0) => GroupStatus::Finished,
        Some(_) => GroupStatus::Failed,
        None if stderr.contains("CANCELLED") => GroupStatus::Cancelled,
        None => GroupStatus::Running,
    }
}

impl ExecutionBackend for SlurmBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Slurm
    }

    fn dispatch(
        &self,
        jobs: &[DispatchJob],
        observer: &mut dyn DispatchObserver,
    ) -> Result<Vec<DispatchOutcome>, ExecutionError> {
        let mut outcomes = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.submit(job) {
                Ok(id) => {
                    let handle = ExecutionHandle::SlurmJob { id };
                    log::debug!("Group {} submitted as {}.", job.index, handle);
                    observer.started(job.index, &handle);
                    outcomes.push(DispatchOutcome::Dispatched(handle));
                }
                Err(e) => {
                    let reason = e.to_string();
                    log::warn!("Submission of group {} failed: {}", job.index, reason);
                    observer.finished(job.index, GroupStatus::Failed, Some(&reason));
                    outcomes.push(DispatchOutcome::Failed(reason));
                }
            }
        }
        Ok(outcomes)
    }

    fn query_status(&self, group: &GroupRecord, _run: &RunRecord) -> GroupStatus {
        if group.handle.is_none() {
            return group.status;
        }
        let read = |name: &str| fs::read_to_string(group.storage_path.join(name)).unwrap_or_default();
        let status = status_from_markers(
            &read(SLURM_EVENTS_FILENAME),
            &read(crate::constants::STDERR_FILENAME),
        );
        if status == GroupStatus::Running && group.status == GroupStatus::Cancelled {
            return GroupStatus::Cancelled;
        }
        status
    }

    fn cancel(&self, run: &RunRecord) -> Result<(), ExecutionError> {
        let ids: Vec<String> = run
            .groups
            .iter()
            .filter(|g| !g.status.is_terminal())
            .filter_map(|g| match &g.handle {
                Some(ExecutionHandle::SlurmJob { id }) => Some(id.clone()),
                _ => None,
            })
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut argv = self.cancel_command.clone();
        argv.extend(ids);
        executor::execute_and_capture_output(&argv, &run.working_directory).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command_builder::{CommandContext, build_command};
    use crate::models::ParameterSet;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn job(group_dir: &Path, index: usize) -> DispatchJob {
        let ctx = CommandContext::new(
            "",
            PathBuf::from("/project/run.sh"),
            vec![],
            PathBuf::from("/project"),
            group_dir.to_path_buf(),
        )
        .unwrap();
        let command = build_command(&ParameterSet::new(), group_dir, &ctx);
        DispatchJob::new(index, command, PathBuf::from("/project"), group_dir.to_path_buf())
    }

    #[test]
    fn test_directive_rendering() {
        assert_eq!(render_directive("-x", "node1"), "-x node1");
        assert_eq!(render_directive("N", "2"), "-N 2");
        assert_eq!(render_directive("--gres", "gpu:1"), "--gres=gpu:1");
        assert_eq!(render_directive("partition", "long"), "--partition=long");
    }

    #[test]
    fn test_job_script_layout() {
        let template = SubmitTemplate {
            name: None,
            directives: vec![("--gres".to_string(), "gpu:1".to_string())],
        };
        let backend = SlurmBackend::new(template, "gaussian_run_2".to_string());
        let script = backend.job_script(&job(Path::new("/runs/run_2/group_1"), 1));

        assert!(script.starts_with("#!/bin/bash\n#SBATCH --job-name=gaussian_run_2_1\n"));
        assert!(script.contains("#SBATCH --output=/runs/run_2/group_1/stdout.txt\n"));
        assert!(script.contains("#SBATCH --gres=gpu:1\n"));
        assert!(script.contains("echo started >> /runs/run_2/group_1/slurm_events.txt\n"));
        assert!(script.contains("/project/run.sh --storage_path /runs/run_2/group_1\n"));
        assert!(script.ends_with("exit $code\n"));
    }

    #[test]
    fn test_parse_job_id() {
        assert_eq!(parse_job_id("12345\n"), Some("12345".to_string()));
        assert_eq!(parse_job_id("12345;cluster_a\n"), Some("12345".to_string()));
        assert_eq!(parse_job_id("Submitted batch job 678\n"), Some("678".to_string()));
        assert_eq!(parse_job_id("sbatch: error: invalid partition"), None);
    }

    #[test]
    fn test_status_from_markers() {
        assert_eq!(status_from_markers("", ""), GroupStatus::Running);
        assert_eq!(status_from_markers("started\n", ""), GroupStatus::Running);
        assert_eq!(status_from_markers("started\nexit_code=0\n", ""), GroupStatus::Finished);
        assert_eq!(status_from_markers("started\nexit_code=1\n", ""), GroupStatus::Failed);
        assert_eq!(
            status_from_markers("started\n", "slurmstepd: error: *** JOB 12 ON n1 CANCELLED AT 2024 ***"),
            GroupStatus::Cancelled
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_dispatch_writes_executable_script() {
        use std::os::unix::fs::PermissionsExt;

        // --- Setup ---
        let dir = tempdir().unwrap();
        let backend = SlurmBackend::new(SubmitTemplate::default(), "b".to_string()).with_commands(
            vec!["sh".to_string(), "-c".to_string(), "echo 991".to_string()],
            vec!["true".to_string()],
        );
        let mut observer = crate::system::backend::RecordingObserver::default();

        // --- Execute ---
        let outcomes = backend.dispatch(&[job(dir.path(), 0)], &mut observer).unwrap();

        // --- Assert ---
        assert_eq!(
            outcomes,
            vec![DispatchOutcome::Dispatched(ExecutionHandle::SlurmJob { id: "991".to_string() })]
        );
        let mode = fs::metadata(dir.path().join(SLURM_SCRIPT_FILENAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
