// src/core/progress.rs

//! # Progress & Status Aggregator
//!
//! Reads the `progress.txt` marker an executable may write in its storage
//! directory and folds per-group progress and status into a run-level view.
//!
//! Recognised marker formats:
//! - a line that is exactly `finished`: the group is done (100%);
//! - first line `tqdm`: the last `<done>/<total>` counter found after it;
//! - first line `count_total=N`: every following line adds its leading number
//!   (1 when absent) to the count, out of `N`.
//!
//! Anything else, including a missing file, is indeterminate. Readers may see
//! a file while it is being written, so a truncated last line is ignored.

use crate::{
    constants::PROGRESS_FILENAME,
    models::{GroupStatus, RunRecord, RunnerKind},
};
use colored::*;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref TQDM_COUNTER: Regex = Regex::new(r"(\d+)/(\d+)").unwrap();
    static ref COUNT_TOTAL: Regex = Regex::new(r"^count_total=(\d+)\s*$").unwrap();
    static ref LEADING_NUMBER: Regex = Regex::new(r"^\s*(\d+)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// Percentage in `[0, 100]`.
    Known(f64),
    Indeterminate,
}

impl Progress {
    pub fn percent(&self) -> Option<f64> {
        match self {
            Self::Known(p) => Some(*p),
            Self::Indeterminate => None,
        }
    }

    fn known(value: f64) -> Self {
        Self::Known(value.clamp(0.0, 100.0))
    }
}

/// Interprets the content of a progress marker.
pub fn parse_progress(text: &str) -> Progress {
    if text.lines().any(|line| line.trim() == "finished") {
        return Progress::Known(100.0);
    }

    let mut lines = text.lines();
    let header = match lines.next() {
        Some(line) => line.trim(),
        None => return Progress::Indeterminate,
    };

    if header == "tqdm" {
        let rest = text.get(text.find('\n').map_or(text.len(), |i| i + 1)..).unwrap_or("");
        return TQDM_COUNTER
            .captures_iter(rest)
            .last()
            .and_then(|caps| {
                let done: f64 = caps.get(1)?.as_str().parse().ok()?;
                let total: f64 = caps.get(2)?.as_str().parse().ok()?;
                (total > 0.0).then(|| Progress::known(100.0 * done / total))
            })
            .unwrap_or(Progress::Indeterminate);
    }

    if let Some(total) = COUNT_TOTAL
        .captures(header)
        .and_then(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .filter(|total| *total > 0)
    {
        let body: Vec<&str> = lines.collect();
        let complete_text = text.ends_with('\n');
        let mut count: u64 = 0;
        for (i, line) in body.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let is_last = i + 1 == body.len();
            match LEADING_NUMBER
                .captures(line)
                .and_then(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
            {
                Some(n) => count = count.saturating_add(n),
                None if is_last && !complete_text => {
                    log::trace!("Ignoring partially written progress line '{}'.", line);
                }
                None => count = count.saturating_add(1),
            }
        }
        return Progress::known(100.0 * count as f64 / total as f64);
    }

    Progress::Indeterminate
}

/// Reads `progress.txt` in a group directory. Missing or unreadable files are
/// indeterminate.
pub fn read_group_progress(group_dir: &Path) -> Progress {
    let path = group_dir.join(PROGRESS_FILENAME);
    match fs::read_to_string(&path) {
        Ok(text) => parse_progress(&text),
        Err(e) => {
            log::debug!("No progress available at '{}': {}", path.display(), e);
            Progress::Indeterminate
        }
    }
}

/// Mean of the known group progresses; indeterminate if none is known.
pub fn run_progress(groups: &[Progress]) -> Progress {
    let known: Vec<f64> = groups.iter().filter_map(Progress::percent).collect();
    if known.is_empty() {
        Progress::Indeterminate
    } else {
        Progress::known(known.iter().sum::<f64>() / known.len() as f64)
    }
}

/// Folds group statuses into the run status.
///
/// Precedence: failed, running, all finished, cancelled, not started.
pub fn aggregate_status(statuses: &[GroupStatus]) -> GroupStatus {
    if statuses.contains(&GroupStatus::Failed) {
        GroupStatus::Failed
    } else if statuses.contains(&GroupStatus::Running) {
        GroupStatus::Running
    } else if !statuses.is_empty() && statuses.iter().all(|s| *s == GroupStatus::Finished) {
        GroupStatus::Finished
    } else if statuses.contains(&GroupStatus::Cancelled) {
        GroupStatus::Cancelled
    } else {
        GroupStatus::NotStarted
    }
}

// --- REPORTS ---

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GroupReport {
    pub index: usize,
    pub storage_path: PathBuf,
    pub status: GroupStatus,
    pub progress: Option<f64>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub run_id: u64,
    pub experiment: String,
    pub runner: RunnerKind,
    pub description: String,
    pub status: GroupStatus,
    pub progress: Option<f64>,
    pub groups: Vec<GroupReport>,
}

impl StatusReport {
    /// Builds a report from a run record and freshly queried group statuses.
    /// Progress is read from each group's storage directory.
    pub fn new(record: &RunRecord, statuses: &[GroupStatus]) -> Self {
        let mut progresses = Vec::with_capacity(record.groups.len());
        let groups = record
            .groups
            .iter()
            .zip(statuses)
            .map(|(group, status)| {
                let progress = match status {
                    GroupStatus::Finished => Progress::Known(100.0),
                    _ => read_group_progress(&group.storage_path),
                };
                progresses.push(progress);
                GroupReport {
                    index: group.index,
                    storage_path: group.storage_path.clone(),
                    status: *status,
                    progress: progress.percent(),
                }
            })
            .collect();

        Self {
            run_id: record.run_id,
            experiment: record.experiment.clone(),
            runner: record.runner,
            description: record.description.clone(),
            status: aggregate_status(statuses),
            progress: run_progress(&progresses).percent(),
            groups,
        }
    }

    /// One-line summary used when listing runs.
    pub fn summary_line(&self) -> String {
        format!(
            "{:>5}  {:<12} {:>7}  {:<9} {}",
            self.run_id,
            colorize_status(self.status),
            format_percent(self.progress),
            self.runner.as_str(),
            self.description.dimmed()
        )
    }

    /// Per-group table of a single run.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} {} {} ({}, {})",
            "Run".bold(),
            self.run_id.to_string().cyan().bold(),
            self.experiment.yellow(),
            colorize_status(self.status),
            format_percent(self.progress)
        );
        for group in &self.groups {
            let _ = writeln!(
                out,
                "  {} {:<4} {:<12} {:>7}  {}",
                "├─".dimmed(),
                group.index,
                colorize_status(group.status),
                format_percent(group.progress),
                group.storage_path.display().to_string().dimmed()
            );
        }
        out
    }
}

fn format_percent(progress: Option<f64>) -> String {
    match progress {
        Some(p) => format!("{:.1}%", p),
        None => "?".to_string(),
    }
}

fn colorize_status(status: GroupStatus) -> ColoredString {
    let label = status.as_str();
    match status {
        GroupStatus::Finished => label.green(),
        GroupStatus::Running => label.cyan(),
        GroupStatus::Failed => label.red().bold(),
        GroupStatus::Cancelled => label.yellow(),
        GroupStatus::NotStarted => label.dimmed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_finished_marker() {
        assert_eq!(parse_progress("finished\n"), Progress::Known(100.0));
        assert_eq!(parse_progress("count_total=10\n3\nfinished\n"), Progress::Known(100.0));
        assert_eq!(parse_progress("unfinished\n"), Progress::Indeterminate);
    }

    #[test]
    fn test_tqdm_uses_last_counter() {
        let text = "tqdm\n 10%|#  | 1/10 [00:01<00:09]\r 50%|#####  | 5/10 [00:05<00:05]";
        assert_eq!(parse_progress(text), Progress::Known(50.0));
        assert_eq!(parse_progress("tqdm\n"), Progress::Indeterminate);
        assert_eq!(parse_progress("tqdm\n20/10"), Progress::Known(100.0));
    }

    #[test]
    fn test_count_total_accumulates() {
        assert_eq!(parse_progress("count_total=4\n1\n1\n"), Progress::Known(50.0));
        assert_eq!(parse_progress("count_total=4\n2\nstep\n"), Progress::Known(75.0));
        assert_eq!(parse_progress("count_total=2\n5\n"), Progress::Known(100.0));
    }

    #[test]
    fn test_count_total_is_capped() {
        let five_steps = format!("count_total=10\n{}", "2\n".repeat(5));
        assert_eq!(parse_progress(&five_steps), Progress::Known(100.0));
        let ten_steps = format!("count_total=10\n{}", "2\n".repeat(10));
        assert_eq!(parse_progress(&ten_steps), Progress::Known(100.0));
    }

    #[test]
    fn test_partial_last_line_is_ignored() {
        // Last line written without its trailing newline and not yet a number.
        assert_eq!(parse_progress("count_total=4\n1\nst"), Progress::Known(25.0));
        // A complete numeric last line still counts.
        assert_eq!(parse_progress("count_total=4\n1\n2"), Progress::Known(75.0));
    }

    #[test]
    fn test_malformed_markers_are_indeterminate() {
        assert_eq!(parse_progress(""), Progress::Indeterminate);
        assert_eq!(parse_progress("count_total=0\n1\n"), Progress::Indeterminate);
        assert_eq!(parse_progress("count_total=abc\n1\n"), Progress::Indeterminate);
        assert_eq!(parse_progress("42\n"), Progress::Indeterminate);
    }

    #[test]
    fn test_missing_file_is_indeterminate() {
        let dir = tempdir().unwrap();
        assert_eq!(read_group_progress(dir.path()), Progress::Indeterminate);
        fs::write(dir.path().join(PROGRESS_FILENAME), "count_total=2\n1\n").unwrap();
        assert_eq!(read_group_progress(dir.path()), Progress::Known(50.0));
    }

    #[test]
    fn test_run_progress_averages_known_groups() {
        let groups = [Progress::Known(100.0), Progress::Indeterminate, Progress::Known(50.0)];
        assert_eq!(run_progress(&groups), Progress::Known(75.0));
        assert_eq!(run_progress(&[Progress::Indeterminate]), Progress::Indeterminate);
    }

    #[test]
    fn test_status_precedence() {
        use GroupStatus::*;
        assert_eq!(aggregate_status(&[Finished, Failed, Running]), Failed);
        assert_eq!(aggregate_status(&[Finished, Running, Cancelled]), Running);
        assert_eq!(aggregate_status(&[Finished, Finished]), Finished);
        assert_eq!(aggregate_status(&[Finished, Cancelled, NotStarted]), Cancelled);
        assert_eq!(aggregate_status(&[NotStarted, Finished]), NotStarted);
        assert_eq!(aggregate_status(&[]), NotStarted);
    }
}
