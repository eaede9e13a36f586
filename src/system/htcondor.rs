// src/system/htcondor.rs

//! # HTCondor Backend
//!
//! Each group is submitted as its own cluster: an `executable.sh` wrapper and
//! a `job.sub` submit description are written to the group directory and
//! handed to `condor_submit`. Status is read back from the job's user event
//! log (`log.txt`), so it is only reliable on the submitting machine.

use crate::{
    constants::{HTCONDOR_EXECUTABLE_FILENAME, HTCONDOR_LOG_FILENAME, HTCONDOR_SUBMIT_FILENAME},
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
    static ref CLUSTER_RE: Regex = Regex::new(r"submitted to cluster (\d+)").unwrap();
    static ref EVENT_RE: Regex = Regex::new(r"^(\d{3}) \(").unwrap();
    static ref RETURN_VALUE_RE: Regex = Regex::new(r"\(return value (\d+)\)").unwrap();
}

#[derive(Debug, Clone)]
pub struct HtcondorBackend {
    template: SubmitTemplate,
    batch_name: String,
    submit_command: Vec<String>,
    remove_command: Vec<String>,
}

impl HtcondorBackend {
    pub fn new(template: SubmitTemplate, batch_name: String) -> Self {
        Self {
            template,
            batch_name,
            submit_command: vec!["condor_submit".to_string()],
            remove_command: vec!["condor_rm".to_string()],
        }
    }

    /// Overrides the scheduler front-ends, e.g. with wrappers.
    pub fn with_commands(mut self, submit: Vec<String>, remove: Vec<String>) -> Self {
        self.submit_command = submit;
        self.remove_command = remove;
        self
    }

    /// Renders the submit description of one job. Template directives
    /// override the base keys; keys are unique in the output.
    pub fn submit_description(&self, job: &DispatchJob) -> String {
        let group_dir = job.group_dir.display().to_string();
        let mut keys: Vec<(String, String)> = vec![
            (
                "executable".to_string(),
                job.group_dir.join(HTCONDOR_EXECUTABLE_FILENAME).display().to_string(),
            ),
            ("output".to_string(), job.stdout.display().to_string()),
            ("error".to_string(), job.stderr.display().to_string()),
            (
                "log".to_string(),
                job.group_dir.join(HTCONDOR_LOG_FILENAME).display().to_string(),
            ),
            ("initialdir".to_string(), group_dir),
            ("getenv".to_string(), "True".to_string()),
            ("batch_name".to_string(), self.batch_name.clone()),
        ];
        for (key, value) in &self.template.directives {
            match keys.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
                Some(entry) => entry.1 = value.clone(),
                None => keys.push((key.clone(), value.clone())),
            }
        }

        let mut out = String::new();
        for (key, value) in keys {
            let _ = writeln!(out, "{} = {}", key, value);
        }
        out.push_str("queue\n");
        out
    }

    fn submit(&self, job: &DispatchJob) -> Result<u64, ExecutionError> {
        let script = format!(
            "#!/bin/bash\ncd {}\n{}\n",
            shell_quote(&job.working_dir),
            job.command.command_line()
        );
        write_job_script(&job.group_dir.join(HTCONDOR_EXECUTABLE_FILENAME), &script)?;

        let submit_path = job.group_dir.join(HTCONDOR_SUBMIT_FILENAME);
        fs::write(&submit_path, self.submit_description(job)).map_err(|e| ExecutionError::Io {
            path: submit_path.display().to_string(),
            source: e,
        })?;

        let mut argv = self.submit_command.clone();
        argv.push(submit_path.display().to_string());
        let output = executor::execute_and_capture_output(&argv, &job.group_dir)?;
        parse_cluster_id(&output).ok_or_else(|| ExecutionError::UnexpectedOutput {
            command: self.submit_command.join(" "),
            output: output.trim().to_string(),
        })
    }
}

/// Extracts the cluster id from `condor_submit` output.
pub fn parse_cluster_id(output: &str) -> Option<u64> {
    CLUSTER_RE
        .captures(output)
        .and_then(|caps| caps.get(1)?.as_str().parse().ok())
}

/// Derives a group status from an HTCondor user event log.
///
/// The last event wins: 000/001/006/012/013 mean the job is alive (queued,
/// executing, resized, held, released), 005 is termination (finished when
/// the return value is 0), 002 is an executable error and 009 an abort.
/// Returns `None` when no event is recognised.
pub fn parse_event_log(log: &str) -> Option<GroupStatus> {
    let mut status = None;
    let mut lines = log.lines().peekable();
    while let Some(line) = lines.next() {
        let code = match EVENT_RE.captures(line).and_then(|c| c.get(1)) {
            Some(code) => code.as_str(),
            None => continue,
        };
        status = match code {
            "000" | "001" | "006" | "012" | "013" => Some(GroupStatus::Running),
            "002" => Some(GroupStatus::Failed),
            "009" => Some(GroupStatus::Cancelled),
            "005" => {
                let mut return_value = None;
                while let Some(detail) = lines.peek() {
                    if detail.trim() == "..." || EVENT_RE.is_match(detail) {
                        break;
                    }
                    if let Some(caps) = RETURN_VALUE_RE.captures(detail) {
                        return_value = caps.get(1).and_then(|m| m.as_str().parse::<i64>().ok());
                    }
                    lines.next();
                }
                match return_value {
                    Some(0) => Some(GroupStatus::Finished),
                    _ => Some(GroupStatus::Failed),
                }
            }
            _ => status,
        };
    }
    status
}

impl ExecutionBackend for HtcondorBackend {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Htcondor
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
                    let handle = ExecutionHandle::Cluster { id };
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
        let log_path = group.storage_path.join(HTCONDOR_LOG_FILENAME);
        let status = match fs::read_to_string(&log_path) {
            Ok(log) => parse_event_log(&log).unwrap_or(GroupStatus::Running),
            Err(e) => {
                log::debug!("No event log at '{}': {}", log_path.display(), e);
                GroupStatus::Running
            }
        };
        // condor_rm was issued but the abort event is not logged yet.
        if status == GroupStatus::Running && group.status == GroupStatus::Cancelled {
            return GroupStatus::Cancelled;
        }
        status
    }

    fn cancel(&self, run: &RunRecord) -> Result<(), ExecutionError> {
        let mut last_error = None;
        for group in &run.groups {
            if let Some(ExecutionHandle::Cluster { id }) = &group.handle {
                let mut argv = self.remove_command.clone();
                argv.push(id.to_string());
                if let Err(e) = executor::execute_and_capture_output(&argv, &run.working_directory) {
                    log::warn!("Could not remove cluster {}: {}", id, e);
                    last_error = Some(e);
                }
            }
        }
        last_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command_builder::{CommandContext, build_command};
    use crate::models::ParameterSet;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn job(group_dir: &Path) -> DispatchJob {
        let ctx = CommandContext::new(
            "python",
            PathBuf::from("exp.py"),
            vec![],
            PathBuf::from("/project"),
            group_dir.to_path_buf(),
        )
        .unwrap();
        let command = build_command(&ParameterSet::new(), group_dir, &ctx);
        DispatchJob::new(0, command, PathBuf::from("/project"), group_dir.to_path_buf())
    }

    #[test]
    fn test_submit_description_applies_template() {
        let template = SubmitTemplate {
            name: Some("default".to_string()),
            directives: vec![
                ("request_cpus".to_string(), "4".to_string()),
                ("getenv".to_string(), "False".to_string()),
            ],
        };
        let backend = HtcondorBackend::new(template, "gaussian_run_3".to_string());
        let description = backend.submit_description(&job(Path::new("/runs/run_3")));

        assert!(description.contains("executable = /runs/run_3/executable.sh\n"));
        assert!(description.contains("log = /runs/run_3/log.txt\n"));
        assert!(description.contains("batch_name = gaussian_run_3\n"));
        assert!(description.contains("request_cpus = 4\n"));
        assert!(description.contains("getenv = False\n"));
        assert!(!description.contains("getenv = True"));
        assert!(description.ends_with("queue\n"));
    }

    #[test]
    fn test_parse_cluster_id() {
        let output = "Submitting job(s).\n1 job(s) submitted to cluster 4821.\n";
        assert_eq!(parse_cluster_id(output), Some(4821));
        assert_eq!(parse_cluster_id("ERROR: no such file"), None);
    }

    #[test]
    fn test_event_log_statuses() {
        let submitted = "000 (4821.000.000) 2024-05-01 10:00:00 Job submitted from host: <10.0.0.1>\n...\n";
        assert_eq!(parse_event_log(submitted), Some(GroupStatus::Running));

        let finished = format!(
            "{}001 (4821.000.000) 2024-05-01 10:01:00 Job executing on host: <10.0.0.2>\n...\n\
             005 (4821.000.000) 2024-05-01 10:05:00 Job terminated.\n\
             \t(1) Normal termination (return value 0)\n...\n",
            submitted
        );
        assert_eq!(parse_event_log(&finished), Some(GroupStatus::Finished));

        let failed = finished.replace("(return value 0)", "(return value 2)");
        assert_eq!(parse_event_log(&failed), Some(GroupStatus::Failed));

        let aborted = format!("{}009 (4821.000.000) 2024-05-01 10:02:00 Job was aborted.\n...\n", submitted);
        assert_eq!(parse_event_log(&aborted), Some(GroupStatus::Cancelled));

        assert_eq!(parse_event_log(""), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_dispatch_with_fake_submitter() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        let fake = dir.path().join("fake_submit.sh");
        fs::write(&fake, "echo \"1 job(s) submitted to cluster 77.\"\n").unwrap();
        let group_dir = dir.path().join("run_1");
        fs::create_dir(&group_dir).unwrap();
        let backend = HtcondorBackend::new(SubmitTemplate::default(), "b".to_string())
            .with_commands(
                vec!["sh".to_string(), fake.display().to_string()],
                vec!["true".to_string()],
            );
        let mut observer = crate::system::backend::RecordingObserver::default();

        // --- Execute ---
        let outcomes = backend.dispatch(&[job(&group_dir)], &mut observer).unwrap();

        // --- Assert ---
        assert_eq!(outcomes, vec![DispatchOutcome::Dispatched(ExecutionHandle::Cluster { id: 77 })]);
        assert!(group_dir.join(HTCONDOR_SUBMIT_FILENAME).is_file());
        let script = fs::read_to_string(group_dir.join(HTCONDOR_EXECUTABLE_FILENAME)).unwrap();
        assert!(script.starts_with("#!/bin/bash\ncd /project\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_submission_marks_group_failed() {
        let dir = tempdir().unwrap();
        let backend = HtcondorBackend::new(SubmitTemplate::default(), "b".to_string())
            .with_commands(vec!["false".to_string()], vec!["true".to_string()]);
        let mut observer = crate::system::backend::RecordingObserver::default();

        let outcomes = backend.dispatch(&[job(dir.path())], &mut observer).unwrap();

        assert!(matches!(outcomes[0], DispatchOutcome::Failed(_)));
        assert_eq!(observer.finished, vec![(0, GroupStatus::Failed)]);
    }
}
