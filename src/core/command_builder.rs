// src/core/command_builder.rs

//! # Command Builder
//!
//! Renders a parameter set into the argument vector of one execution unit.
//! Building is pure: no filesystem access, no process spawning. Container
//! technology detection happens once, up front, in [`ContainerRef::resolve`].

use crate::models::ParameterSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Option appended to every command, pointing at the group's storage directory.
pub const STORAGE_PATH_OPTION: &str = "storage_path";
/// Option appended once per dataset of the experiment.
pub const DATASET_PATH_OPTION: &str = "dataset_path";

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("Could not split executable command '{0}'.")]
    UnparsableLauncher(String),
    #[error("Container image '{0}' does not exist.")]
    ImageNotFound(String),
    #[error("Unsupported container '{0}': only Apptainer/Singularity .sif images are supported.")]
    UnsupportedContainer(String),
    #[error("Neither 'apptainer' nor 'singularity' was found in PATH.")]
    NoContainerRuntime,
}

// --- CONTAINERS ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerTech {
    Apptainer,
    Singularity,
}

impl ContainerTech {
    pub fn program(&self) -> &'static str {
        match self {
            Self::Apptainer => "apptainer",
            Self::Singularity => "singularity",
        }
    }
}

/// A container image together with the runtime that will execute it.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRef {
    pub tech: ContainerTech,
    pub image: PathBuf,
    /// Extra runtime flags placed between `run` and the binds (e.g. `--nv`).
    pub extra_flags: Vec<String>,
}

impl ContainerRef {
    /// Resolves the runtime for `image` by looking for it on `PATH`.
    pub fn resolve(image: &Path) -> Result<Self, CommandError> {
        Self::resolve_with(image, is_executable_in_path)
    }

    /// Same as [`resolve`](Self::resolve) with an injectable `PATH` lookup.
    pub fn resolve_with(
        image: &Path,
        in_path: impl Fn(&str) -> bool,
    ) -> Result<Self, CommandError> {
        let is_sif = image
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("sif"));
        if !is_sif {
            return Err(CommandError::UnsupportedContainer(image.display().to_string()));
        }
        if !image.is_file() {
            return Err(CommandError::ImageNotFound(image.display().to_string()));
        }

        let tech = if in_path(ContainerTech::Apptainer.program()) {
            ContainerTech::Apptainer
        } else if in_path(ContainerTech::Singularity.program()) {
            ContainerTech::Singularity
        } else {
            return Err(CommandError::NoContainerRuntime);
        };
        log::debug!("Using {} for image '{}'.", tech.program(), image.display());

        Ok(Self {
            tech,
            image: image.to_path_buf(),
            extra_flags: Vec::new(),
        })
    }

    pub fn with_extra_flags(mut self, flags: Vec<String>) -> Self {
        self.extra_flags = flags;
        self
    }
}

fn is_executable_in_path(executable_name: &str) -> bool {
    if let Ok(path_var) = env::var("PATH") {
        for path in env::split_paths(&path_var) {
            if path.join(executable_name).is_file() {
                return true;
            }
        }
    }
    false
}

// --- BUILDING ---

/// Everything shared by the commands of one run.
#[derive(Debug, Clone)]
pub struct CommandContext {
    launcher: Vec<String>,
    pub executable: PathBuf,
    pub datasets: Vec<PathBuf>,
    pub working_dir: PathBuf,
    pub run_dir: PathBuf,
    pub container: Option<ContainerRef>,
}

impl CommandContext {
    /// `executable_command` is the (possibly empty) launcher placed before the
    /// executable, e.g. `python -u`.
    pub fn new(
        executable_command: &str,
        executable: PathBuf,
        datasets: Vec<PathBuf>,
        working_dir: PathBuf,
        run_dir: PathBuf,
    ) -> Result<Self, CommandError> {
        let launcher = shlex::split(executable_command)
            .ok_or_else(|| CommandError::UnparsableLauncher(executable_command.to_string()))?;
        Ok(Self {
            launcher,
            executable,
            datasets,
            working_dir,
            run_dir,
            container: None,
        })
    }

    pub fn with_container(mut self, container: Option<ContainerRef>) -> Self {
        self.container = container;
        self
    }

    fn container_prefix(&self, container: &ContainerRef) -> Vec<String> {
        let mut prefix = vec![container.tech.program().to_string(), "run".to_string()];
        prefix.extend(container.extra_flags.iter().cloned());

        let mut binds: Vec<&Path> = vec![&self.working_dir, &self.run_dir];
        binds.extend(self.datasets.iter().map(PathBuf::as_path));
        let mut seen = Vec::with_capacity(binds.len());
        for bind in binds {
            if seen.contains(&bind) {
                continue;
            }
            seen.push(bind);
            let shown = bind.display();
            prefix.push("--bind".to_string());
            prefix.push(format!("{}:{}", shown, shown));
        }

        prefix.push(container.image.display().to_string());
        prefix
    }
}

/// The argument vector of one execution unit.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCommand {
    argv: Vec<String>,
    /// Index of the first argument after the executable.
    args_start: usize,
}

impl BuiltCommand {
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Arguments handed to the executable itself.
    pub fn executable_args(&self) -> &[String] {
        self.argv.get(self.args_start..).unwrap_or(&[])
    }

    /// Shell-quoted single-line rendering, suitable for logs and job scripts.
    pub fn command_line(&self) -> String {
        match shlex::try_join(self.argv.iter().map(String::as_str)) {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Could not shell-quote command ({}); joining verbatim.", e);
                self.argv.join(" ")
            }
        }
    }

    /// The `--name value` pairs passed to the executable, excluding the
    /// storage and dataset options added by the builder.
    pub fn option_pairs(&self) -> Vec<(String, String)> {
        parse_option_pairs(self.executable_args())
            .into_iter()
            .filter(|(name, _)| name != STORAGE_PATH_OPTION && name != DATASET_PATH_OPTION)
            .collect()
    }
}

impl fmt::Display for BuiltCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Builds the command for one parameter set.
///
/// Layout: `[container prefix] launcher... executable positionals...
/// --name value... --storage_path <dir> [--dataset_path <p>]...`
pub fn build_command(set: &ParameterSet, storage_path: &Path, ctx: &CommandContext) -> BuiltCommand {
    let mut argv = match &ctx.container {
        Some(container) => ctx.container_prefix(container),
        None => Vec::new(),
    };
    argv.extend(ctx.launcher.iter().cloned());
    argv.push(ctx.executable.display().to_string());
    let args_start = argv.len();

    argv.extend(set.positional().map(|(_, value)| value.to_string()));
    for (name, value) in set.options() {
        argv.push(format!("--{}", name));
        argv.push(value.to_string());
    }

    argv.push(format!("--{}", STORAGE_PATH_OPTION));
    argv.push(storage_path.display().to_string());
    for dataset in &ctx.datasets {
        argv.push(format!("--{}", DATASET_PATH_OPTION));
        argv.push(dataset.display().to_string());
    }

    BuiltCommand { argv, args_start }
}

/// Re-parses `--name value` pairs from an argument list. Tokens not preceded
/// by an option name are positionals and are skipped.
pub fn parse_option_pairs(args: &[String]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut iter = args.iter();
    while let Some(token) = iter.next() {
        if let Some(name) = token.strip_prefix("--") {
            if let Some(value) = iter.next() {
                pairs.push((name.to_string(), value.clone()));
            }
        }
    }
    pairs
}
