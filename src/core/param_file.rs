// src/core/param_file.rs

//! # Parameter File Loader
//!
//! Reads a YAML or TOML parameter file into the same `ExpansionInput` the CLI
//! flags produce, so both paths expand identically.

use crate::core::expander::{self, ExpansionError};
use crate::models::{ExpansionInput, ParamValue, ParameterSet, RangeArg, RangeSpec};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParamFileError {
    #[error("Could not read parameter file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Parameter file '{0}' must have a .yaml, .yml or .toml extension.")]
    UnsupportedFormat(String),
    #[error("Failed to parse YAML parameter file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to parse TOML parameter file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid parameter file: {0}")]
    Invalid(String),
    #[error(transparent)]
    Expansion(#[from] ExpansionError),
}

// --- ON-DISK SHAPE ---

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ParameterFile {
    #[serde(default)]
    fixed_args: ArgBlock,
    #[serde(default)]
    varying_args: VaryingBlock,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct ArgBlock {
    #[serde(default)]
    positional: Vec<Value>,
    #[serde(default)]
    options: Mapping,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct VaryingBlock {
    #[serde(default)]
    range: RangeBlock,
    #[serde(default)]
    groups: Vec<ArgBlock>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RangeBlock {
    #[serde(default)]
    options: Mapping,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RangeEntry {
    Stepped { start: f64, stop: f64, step: f64 },
    List(Vec<f64>),
}

// --- LOADING ---

/// Loads a parameter file, choosing the format from its extension.
pub fn load_parameter_file(path: &Path) -> Result<ExpansionInput, ParamFileError> {
    let content = fs::read_to_string(path).map_err(|e| ParamFileError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let file: ParameterFile = match extension.as_deref() {
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
        Some("toml") => toml::from_str(&content)?,
        _ => return Err(ParamFileError::UnsupportedFormat(path.display().to_string())),
    };

    log::debug!("Loaded parameter file '{}'.", path.display());
    into_expansion_input(file)
}

/// Parses YAML parameter-file content directly.
pub fn parse_yaml_parameters(content: &str) -> Result<ExpansionInput, ParamFileError> {
    into_expansion_input(serde_yaml::from_str(content)?)
}

fn into_expansion_input(file: ParameterFile) -> Result<ExpansionInput, ParamFileError> {
    let fixed = block_to_set(&file.fixed_args, 0)?;
    let first_group_slot = fixed.next_positional_slot();

    let groups = file
        .varying_args
        .groups
        .iter()
        .map(|group| block_to_set(group, first_group_slot))
        .collect::<Result<Vec<_>, _>>()?;

    let mut ranges = Vec::with_capacity(file.varying_args.range.options.len());
    for (key, value) in &file.varying_args.range.options {
        let name = option_name(key)?;
        let entry: RangeEntry = serde_yaml::from_value(value.clone()).map_err(|_| {
            ParamFileError::Invalid(format!(
                "range '--{}' must be a {{start, stop, step}} mapping or a list of numbers",
                name
            ))
        })?;
        let range = RangeArg {
            spec: match entry {
                RangeEntry::Stepped { start, stop, step } => RangeSpec::Stepped { start, stop, step },
                RangeEntry::List(values) => RangeSpec::Values(values),
            },
            name,
        };
        expander::validate_range(&range, &format!("--{}", range.name))?;
        ranges.push(range);
    }

    Ok(ExpansionInput {
        fixed,
        groups,
        ranges,
    })
}

fn block_to_set(block: &ArgBlock, first_positional: usize) -> Result<ParameterSet, ParamFileError> {
    let mut set = ParameterSet::new();
    for (offset, value) in block.positional.iter().enumerate() {
        set = set.with_positional(first_positional + offset, scalar_to_value(value)?);
    }
    for (key, value) in &block.options {
        let name = option_name(key)?;
        if set.contains_option(&name) {
            return Err(ExpansionError::DuplicateOption(name).into());
        }
        set = set.with_option(name, scalar_to_value(value)?);
    }
    Ok(set)
}

/// Option keys may be written with or without the leading `--`.
fn option_name(key: &Value) -> Result<String, ParamFileError> {
    let raw = key
        .as_str()
        .ok_or_else(|| ParamFileError::Invalid(format!("option name {:?} is not a string", key)))?;
    let name = raw.strip_prefix("--").unwrap_or(raw);
    if name.is_empty() {
        return Err(ParamFileError::Invalid("empty option name".to_string()));
    }
    Ok(name.to_string())
}

fn scalar_to_value(value: &Value) -> Result<ParamValue, ParamFileError> {
    match value {
        Value::String(s) => Ok(ParamValue::text(s.clone())),
        Value::Bool(b) => Ok(ParamValue::text(b.to_string())),
        Value::Number(n) if n.is_f64() => n
            .as_f64()
            .map(ParamValue::Float)
            .ok_or_else(|| ParamFileError::Invalid(format!("unrepresentable number {}", n))),
        Value::Number(n) => Ok(ParamValue::text(n.to_string())),
        other => Err(ParamFileError::Invalid(format!(
            "argument values must be scalars, found {:?}",
            other
        ))),
    }
}
