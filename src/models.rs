// src/models.rs

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// --- PARAMETER MODELS ---
// Produced by the expander, consumed by the command builder and written to
// `group_info.yaml` in their string form.

/// A single argument value. Range-derived values are always `Float`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            // Integral floats keep a trailing `.0` so executables see `5.0`, not `5`.
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 => {
                write!(f, "{:.1}", v)
            }
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

/// One concrete set of arguments for an execution unit.
///
/// Positional slots are keyed by their index ("weight"); options keep their
/// insertion order and are stored without the leading `--`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    positional: BTreeMap<usize, ParamValue>,
    options: Vec<(String, ParamValue)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with the positional slot `index` set to `value`.
    pub fn with_positional(mut self, index: usize, value: ParamValue) -> Self {
        self.positional.insert(index, value);
        self
    }

    /// Returns a copy with option `name` set to `value`. An existing option
    /// keeps its position and gets the new value.
    pub fn with_option(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        let name = name.into();
        match self.options.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.options.push((name, value)),
        }
        self
    }

    /// Merges `other` on top of `self`. Entries of `other` win on collision.
    pub fn overlay(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (index, value) in &other.positional {
            merged.positional.insert(*index, value.clone());
        }
        for (name, value) in &other.options {
            merged = merged.with_option(name.clone(), value.clone());
        }
        merged
    }

    /// Moves every positional slot `offset` places to the right.
    pub fn shift_positionals(mut self, offset: usize) -> Self {
        self.positional = self
            .positional
            .into_iter()
            .map(|(index, value)| (index + offset, value))
            .collect();
        self
    }

    /// Removes option `name`, returning the remaining set and the removed value.
    pub fn without_option(mut self, name: &str) -> (Self, Option<ParamValue>) {
        let removed = self
            .options
            .iter()
            .position(|(n, _)| n == name)
            .map(|pos| self.options.remove(pos).1);
        (self, removed)
    }

    pub fn positional(&self) -> impl Iterator<Item = (usize, &ParamValue)> {
        self.positional.iter().map(|(i, v)| (*i, v))
    }

    pub fn options(&self) -> &[(String, ParamValue)] {
        &self.options
    }

    pub fn option(&self, name: &str) -> Option<&ParamValue> {
        self.options.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains_option(&self, name: &str) -> bool {
        self.option(name).is_some()
    }

    pub fn positional_count(&self) -> usize {
        self.positional.len()
    }

    /// The first free positional slot after the highest declared one.
    pub fn next_positional_slot(&self) -> usize {
        self.positional.keys().next_back().map_or(0, |last| last + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.options.is_empty()
    }

    /// Flattens the set into `name -> value` pairs, `pos_<i>` for positionals
    /// and `--name` for options, in command order.
    pub fn to_named_strings(&self) -> Vec<(String, String)> {
        self.positional
            .iter()
            .map(|(i, v)| (format!("pos_{}", i), v.to_string()))
            .chain(
                self.options
                    .iter()
                    .map(|(n, v)| (format!("--{}", n), v.to_string())),
            )
            .collect()
    }
}

/// A declarative numeric range. Always produces floating-point values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum RangeSpec {
    Values(Vec<f64>),
    Stepped { start: f64, stop: f64, step: f64 },
}

/// A range bound to the option it varies.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeArg {
    pub name: String,
    pub spec: RangeSpec,
}

/// Everything the expander needs, whether it came from CLI flags or from a
/// parameter file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionInput {
    pub fixed: ParameterSet,
    pub groups: Vec<ParameterSet>,
    pub ranges: Vec<RangeArg>,
}

// --- EXECUTION MODELS ---

/// The execution backend selected for a run.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Local,
    Htcondor,
    Slurm,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Htcondor => "htcondor",
            Self::Slurm => "slurm",
        }
    }
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single group.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    #[default]
    NotStarted,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl GroupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not-started",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a dispatched group, owned by the backend that produced it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionHandle {
    Process { pid: u32 },
    Cluster { id: u64 },
    SlurmJob { id: String },
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { pid } => write!(f, "pid {}", pid),
            Self::Cluster { id } => write!(f, "cluster {}", id),
            Self::SlurmJob { id } => write!(f, "job {}", id),
        }
    }
}

/// Runner-specific knobs extracted from the command line.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunnerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

// --- METADATA RECORDS ---
// What ends up on disk in the run directory.

/// Contents of `group_info.yaml`. Parameters are listed in command order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupInfo {
    pub command: String,
    pub parameters: serde_yaml::Mapping,
}

impl GroupInfo {
    pub fn new(command: String, set: &ParameterSet) -> Self {
        let parameters = set
            .to_named_strings()
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        Self {
            command,
            parameters,
        }
    }

    /// The recorded value of `pos_<i>` or `--name`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(serde_yaml::Value::as_str)
    }
}

/// The per-group part of a run record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupRecord {
    pub index: usize,
    pub storage_path: PathBuf,
    pub command: String,
    #[serde(default)]
    pub status: GroupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ExecutionHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Contents of `info.yaml`, the record of one run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: u64,
    pub experiment: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub launched: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Local>>,
    pub runner: RunnerKind,
    #[serde(default)]
    pub runner_settings: RunnerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub storage_path: PathBuf,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_pid: Option<u32>,
    pub groups: Vec<GroupRecord>,
}

impl RunRecord {
    pub fn group_statuses(&self) -> Vec<GroupStatus> {
        self.groups.iter().map(|g| g.status).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_values_render_like_the_executable_expects() {
        assert_eq!(ParamValue::Float(5.0).to_string(), "5.0");
        assert_eq!(ParamValue::Float(105.0).to_string(), "105.0");
        assert_eq!(ParamValue::Float(0.25).to_string(), "0.25");
        assert_eq!(ParamValue::Float(-3.0).to_string(), "-3.0");
        assert_eq!(ParamValue::text("10,-50").to_string(), "10,-50");
    }

    #[test]
    fn test_overlay_later_entries_win_and_keep_position() {
        let base = ParameterSet::new()
            .with_positional(0, ParamValue::text("a"))
            .with_option("mean", ParamValue::text("1"))
            .with_option("cov", ParamValue::text("I"));
        let top = ParameterSet::new()
            .with_positional(0, ParamValue::text("b"))
            .with_option("mean", ParamValue::text("2"));

        let merged = base.overlay(&top);
        assert_eq!(merged.positional().next(), Some((0, &ParamValue::text("b"))));
        assert_eq!(
            merged.options(),
            &[
                ("mean".to_string(), ParamValue::text("2")),
                ("cov".to_string(), ParamValue::text("I")),
            ]
        );
    }

    #[test]
    fn test_named_strings_use_pos_and_dash_prefixes() {
        let set = ParameterSet::new()
            .with_positional(1, ParamValue::text("500"))
            .with_positional(0, ParamValue::text("10"))
            .with_option("n_samples", ParamValue::Float(5.0));
        assert_eq!(
            set.to_named_strings(),
            vec![
                ("pos_0".to_string(), "10".to_string()),
                ("pos_1".to_string(), "500".to_string()),
                ("--n_samples".to_string(), "5.0".to_string()),
            ]
        );
        assert_eq!(set.next_positional_slot(), 2);
    }

    #[test]
    fn test_group_info_lists_parameters_in_command_order() {
        let set = ParameterSet::new()
            .with_positional(0, ParamValue::text("10"))
            .with_option("cov", ParamValue::text("A"))
            .with_option("alpha", ParamValue::Float(0.5));
        let info = GroupInfo::new("exp.py 10 --cov A --alpha 0.5".to_string(), &set);

        let yaml = serde_yaml::to_string(&info).unwrap();
        let pos = yaml.find("pos_0").unwrap();
        let cov = yaml.find("--cov").unwrap();
        let alpha = yaml.find("--alpha").unwrap();
        assert!(pos < cov && cov < alpha, "{}", yaml);
        assert_eq!(info.parameter("--alpha"), Some("0.5"));
        assert_eq!(serde_yaml::from_str::<GroupInfo>(&yaml).unwrap(), info);
    }

    #[test]
    fn test_group_status_serializes_snake_case() {
        let yaml = serde_yaml::to_string(&GroupStatus::NotStarted).unwrap();
        assert_eq!(yaml.trim(), "not_started");
        let back: GroupStatus = serde_yaml::from_str("cancelled").unwrap();
        assert_eq!(back, GroupStatus::Cancelled);
    }
}
