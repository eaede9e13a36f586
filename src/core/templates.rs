// src/core/templates.rs

//! # Submission Templates
//!
//! A template is an ordered list of scheduler directives (HTCondor submit keys
//! or Slurm `#SBATCH` options) merged into every job of a run. Templates are
//! resolved once, before anything is submitted.

use crate::{
    constants::DEFAULT_TEMPLATE_NAME,
    core::config_loader::ProjectConfig,
    models::RunnerKind,
};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("No '{name}' template is configured for the {runner} runner.")]
    NotFound { runner: RunnerKind, name: String },
    #[error("Could not read template file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Template file '{path}' is not a valid mapping: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitTemplate {
    pub name: Option<String>,
    pub directives: Vec<(String, String)>,
}

impl SubmitTemplate {
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }
}

/// Resolves the template for `runner`.
///
/// `selector` is either a path to a YAML/TOML file (relative paths are
/// anchored at the project root) or the name of a configured template.
/// Without a selector, the `default` template is used when configured.
pub fn resolve_template(
    runner: RunnerKind,
    selector: Option<&str>,
    config: &ProjectConfig,
) -> Result<SubmitTemplate, TemplateError> {
    if runner == RunnerKind::Local {
        if selector.is_some() {
            log::debug!("The local runner ignores submission templates.");
        }
        return Ok(SubmitTemplate::default());
    }

    if let Some(selector) = selector {
        let candidate = config.root.join(selector);
        if candidate.is_file() {
            return load_template_file(&candidate);
        }
    }

    let name = selector.unwrap_or(DEFAULT_TEMPLATE_NAME);
    let configured = config
        .templates_for(runner)
        .and_then(|templates| templates.get(name));

    match configured {
        Some(table) => {
            log::debug!("Using '{}' template for the {} runner.", name, runner);
            Ok(SubmitTemplate {
                name: Some(name.to_string()),
                directives: table
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
            })
        }
        None if selector.is_none() => Ok(SubmitTemplate::default()),
        None => Err(TemplateError::NotFound {
            runner,
            name: name.to_string(),
        }),
    }
}

/// Loads a template from a YAML or TOML mapping file. YAML key order is kept.
pub fn load_template_file(path: &Path) -> Result<SubmitTemplate, TemplateError> {
    let parse_error = |reason: String| TemplateError::Parse {
        path: path.display().to_string(),
        reason,
    };

    let content = fs::read_to_string(path).map_err(|e| TemplateError::Io {
        path: path.display().to_string(),
        source: e,
    })?;

    let is_toml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
    let mapping: Mapping = if is_toml {
        toml::from_str(&content).map_err(|e| parse_error(e.to_string()))?
    } else {
        serde_yaml::from_str(&content).map_err(|e| parse_error(e.to_string()))?
    };

    let mut directives = Vec::with_capacity(mapping.len());
    for (key, value) in &mapping {
        let key = key
            .as_str()
            .ok_or_else(|| parse_error(format!("key {:?} is not a string", key)))?;
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => return Err(parse_error(format!("value of '{}' is not a scalar: {:?}", key, other))),
        };
        directives.push((key.to_string(), value));
    }

    Ok(SubmitTemplate {
        name: path.file_stem().map(|s| s.to_string_lossy().into_owned()),
        directives,
    })
}
