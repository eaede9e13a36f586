// src/core/config_loader.rs

//! # Config Loader
//!
//! Loads `.qanat/qanat.toml`, the project configuration: where runs are
//! stored, the default runner, the experiment catalog and the named
//! submission templates of each runner.

use crate::{
    constants::{DEFAULT_RESULT_DIR, PROJECT_CONFIG_FILENAME, QANAT_DIR},
    core::paths::{self, PathError},
    models::RunnerKind,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("Could not read project config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse project config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("Experiment '{0}' does not exist in this project.")]
    UnknownExperiment(String),
    #[error("Experiment '{0}' is declared more than once.")]
    DuplicateExperiment(String),
}

/// A template directive value. TOML and YAML scalars are all accepted and
/// rendered to their string form.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum DirectiveValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for DirectiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Integer(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// `templates.<runner>.<name>.<directive> = value`
pub type TemplateCatalog = BTreeMap<String, BTreeMap<String, BTreeMap<String, DirectiveValue>>>;

/// One entry of the experiment catalog.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub name: String,
    pub executable: PathBuf,
    /// Launcher placed before the executable, e.g. `python`. May be empty.
    #[serde(default)]
    pub executable_command: String,
    #[serde(default)]
    pub datasets: Vec<PathBuf>,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    /// Directory containing `.qanat/`. Commands run from here.
    #[serde(skip)]
    pub root: PathBuf,
    #[serde(default = "default_result_dir")]
    pub result_dir: String,
    #[serde(default)]
    pub default_runner: RunnerKind,
    #[serde(default)]
    pub experiments: Vec<ExperimentConfig>,
    #[serde(default)]
    pub templates: TemplateCatalog,
}

fn default_result_dir() -> String {
    DEFAULT_RESULT_DIR.to_string()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            result_dir: default_result_dir(),
            default_runner: RunnerKind::default(),
            experiments: Vec::new(),
            templates: TemplateCatalog::new(),
        }
    }
}

impl ProjectConfig {
    /// Finds the project enclosing `start` and loads its configuration.
    pub fn discover(start: &Path) -> Result<Self, ConfigError> {
        let root = paths::find_project_root(start)?;
        Self::load(&root)
    }

    /// Loads the configuration of the project rooted at `root`.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(QANAT_DIR).join(PROJECT_CONFIG_FILENAME);
        log::debug!("Loading project config from '{}'.", path.display());

        let content = if path.is_file() {
            fs::read_to_string(&path).map_err(|e| ConfigError::Io {
                path: path.display().to_string(),
                source: e,
            })?
        } else {
            log::debug!("No '{}' found, using defaults.", PROJECT_CONFIG_FILENAME);
            String::new()
        };

        let mut config = Self::from_toml_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        config.root = root.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, experiment) in self.experiments.iter().enumerate() {
            if self.experiments.iter().skip(i + 1).any(|e| e.name == experiment.name) {
                return Err(ConfigError::DuplicateExperiment(experiment.name.clone()));
            }
        }
        Ok(())
    }

    /// Absolute path of the result directory.
    pub fn result_dir_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(paths::expand_path(&self.result_dir, &self.root)?)
    }

    pub fn experiment(&self, name: &str) -> Result<&ExperimentConfig, ConfigError> {
        self.experiments
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| ConfigError::UnknownExperiment(name.to_string()))
    }

    /// Named templates configured for `runner`, if any.
    pub fn templates_for(&self, runner: RunnerKind) -> Option<&BTreeMap<String, BTreeMap<String, DirectiveValue>>> {
        self.templates.get(runner.as_str())
    }
}

impl ExperimentConfig {
    /// Executable path anchored at the project root.
    pub fn executable_path(&self, root: &Path) -> PathBuf {
        root.join(&self.executable)
    }

    /// Dataset paths anchored at the project root.
    pub fn dataset_paths(&self, root: &Path) -> Vec<PathBuf> {
        self.datasets.iter().map(|d| root.join(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
result_dir = "runs"
default_runner = "slurm"

[[experiments]]
name = "gaussian"
executable = "experiments/gaussian.py"
executable_command = "python"
datasets = ["data/set1"]

[templates.htcondor.default]
request_cpus = 4
getenv = true

[templates.slurm.gpu]
"--gres" = "gpu:1"
"-N" = "1"
"#;

    #[test]
    fn test_parse_full_config() {
        let config = ProjectConfig::from_toml_str(CONFIG).unwrap();

        assert_eq!(config.default_runner, RunnerKind::Slurm);
        let experiment = config.experiment("gaussian").unwrap();
        assert_eq!(experiment.executable_command, "python");
        assert_eq!(
            experiment.dataset_paths(Path::new("/p")),
            vec![PathBuf::from("/p/data/set1")]
        );

        let htcondor = config.templates_for(RunnerKind::Htcondor).unwrap();
        let default = htcondor.get("default").unwrap();
        assert_eq!(default.get("request_cpus").unwrap().to_string(), "4");
        assert_eq!(default.get("getenv").unwrap().to_string(), "true");
        assert!(config.templates_for(RunnerKind::Local).is_none());
    }

    #[test]
    fn test_load_from_project_root() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(QANAT_DIR)).unwrap();
        fs::write(dir.path().join(QANAT_DIR).join(PROJECT_CONFIG_FILENAME), CONFIG).unwrap();

        // --- Execute ---
        let config = ProjectConfig::load(dir.path()).unwrap();

        // --- Assert ---
        assert_eq!(config.result_dir_path().unwrap(), dir.path().join("runs"));
        assert!(matches!(
            config.experiment("missing"),
            Err(ConfigError::UnknownExperiment(_))
        ));
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.result_dir, DEFAULT_RESULT_DIR);
        assert_eq!(config.default_runner, RunnerKind::Local);
        assert!(config.experiments.is_empty());
    }

    #[test]
    fn test_duplicate_experiments_are_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(QANAT_DIR)).unwrap();
        fs::write(
            dir.path().join(QANAT_DIR).join(PROJECT_CONFIG_FILENAME),
            "[[experiments]]\nname = \"a\"\nexecutable = \"a.py\"\n\n[[experiments]]\nname = \"a\"\nexecutable = \"b.py\"\n",
        )
        .unwrap();
        assert!(matches!(
            ProjectConfig::load(dir.path()),
            Err(ConfigError::DuplicateExperiment(_))
        ));
    }
}
