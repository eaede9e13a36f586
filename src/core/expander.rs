// src/core/expander.rs

//! # Argument Expander
//!
//! Turns fixed arguments, explicit groups and ranges into the ordered list of
//! concrete parameter sets of a run. Group indices (and therefore storage
//! directories) follow the order produced here.

use crate::constants::{MAX_RANGE_VALUES, RUNNER_PARAM_TEMPLATE, RUNNER_PARAM_THREADS};
use crate::models::{
    ExpansionInput, ParamValue, ParameterSet, RangeArg, RangeSpec, RunnerSettings,
};
use std::collections::HashSet;
use thiserror::Error;

const STEP_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug, PartialEq)]
pub enum ExpansionError {
    #[error("Option '--{0}' has no value.")]
    MissingOptionValue(String),
    #[error("Option '--{0}' is declared more than once in the same argument set.")]
    DuplicateOption(String),
    #[error("Could not split group declaration: {0}")]
    UnparsableGroup(String),
    #[error("Malformed range '{declaration}': {reason}")]
    MalformedRange { declaration: String, reason: String },
    #[error("Option '--{0}' is varied by more than one range.")]
    DuplicateRange(String),
    #[error("Positional arguments are not contiguous: slot {missing} is empty but slot {present} is set.")]
    PositionalGap { missing: usize, present: usize },
    #[error("Invalid value '{value}' for runner parameter '--{name}'.")]
    InvalidRunnerParameter { name: String, value: String },
}

// --- TOKEN PARSING ---

/// Parses raw CLI tokens into a parameter set.
///
/// A token starting with `--` names an option and always takes the next token
/// as its value, so values such as `-50` or `10,-50` are never mistaken for
/// flags. Every other token fills the next positional slot, starting at
/// `first_positional`.
pub fn parse_cli_tokens<S: AsRef<str>>(
    tokens: &[S],
    first_positional: usize,
) -> Result<ParameterSet, ExpansionError> {
    let mut set = ParameterSet::new();
    let mut next_slot = first_positional;
    let mut iter = tokens.iter().map(AsRef::as_ref);

    while let Some(token) = iter.next() {
        if let Some(name) = token.strip_prefix("--") {
            let value = iter
                .next()
                .ok_or_else(|| ExpansionError::MissingOptionValue(name.to_string()))?;
            if set.contains_option(name) {
                return Err(ExpansionError::DuplicateOption(name.to_string()));
            }
            set = set.with_option(name, ParamValue::text(value));
        } else {
            set = set.with_positional(next_slot, ParamValue::text(token));
            next_slot += 1;
        }
    }
    Ok(set)
}

/// Parses an ad hoc group declaration such as `"10 500 --cov B"`.
pub fn parse_group_declaration(
    declaration: &str,
    first_positional: usize,
) -> Result<ParameterSet, ExpansionError> {
    let tokens = shlex::split(declaration)
        .ok_or_else(|| ExpansionError::UnparsableGroup(declaration.to_string()))?;
    parse_cli_tokens(&tokens, first_positional)
}

/// Parses a range declaration.
///
/// Two forms are accepted:
/// - `--name start stop step` for a half-open stepped range;
/// - `--name v1,v2,v3` for an explicit list.
pub fn parse_range_declaration(declaration: &str) -> Result<RangeArg, ExpansionError> {
    let malformed = |reason: &str| ExpansionError::MalformedRange {
        declaration: declaration.to_string(),
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = declaration.split_whitespace().collect();
    let (name_token, values) = parts
        .split_first()
        .ok_or_else(|| malformed("empty declaration"))?;
    let name = name_token
        .strip_prefix("--")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| malformed("only options (--name) can be varied by a range"))?;

    let parse_number = |raw: &str| -> Result<f64, ExpansionError> {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| malformed(&format!("'{}' is not a number", raw)))
    };

    let spec = match *values {
        [list] => RangeSpec::Values(
            list.split(',')
                .filter(|v| !v.trim().is_empty())
                .map(parse_number)
                .collect::<Result<_, _>>()?,
        ),
        [start, stop, step] => RangeSpec::Stepped {
            start: parse_number(start)?,
            stop: parse_number(stop)?,
            step: parse_number(step)?,
        },
        _ => return Err(malformed("expected '--name start stop step' or '--name v1,v2,...'")),
    };

    let range = RangeArg {
        name: name.to_string(),
        spec,
    };
    validate_range(&range, declaration)?;
    Ok(range)
}

/// Checks that a range is well formed and produces at least one value.
pub fn validate_range(range: &RangeArg, declaration: &str) -> Result<(), ExpansionError> {
    let malformed = |reason: &str| ExpansionError::MalformedRange {
        declaration: declaration.to_string(),
        reason: reason.to_string(),
    };
    match &range.spec {
        RangeSpec::Stepped { start, stop, step } => {
            if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
                return Err(malformed("bounds must be finite numbers"));
            }
            if *step <= 0.0 {
                return Err(malformed("step must be strictly positive"));
            }
            if stepped_count(*start, *stop, *step) > f64::from(MAX_RANGE_VALUES) {
                return Err(malformed(&format!(
                    "range produces more than {} values",
                    MAX_RANGE_VALUES
                )));
            }
        }
        RangeSpec::Values(values) => {
            if values.iter().any(|v| !v.is_finite()) {
                return Err(malformed("values must be finite numbers"));
            }
        }
    }
    if range.spec.values().is_empty() {
        return Err(malformed("range produces no values"));
    }
    Ok(())
}

impl RangeSpec {
    /// Generates the values of the range, in order.
    ///
    /// Stepped values are `start + k * step` for `k` in `0..count`, with
    /// `count = ceil((stop - start) / step)`.
    pub fn values(&self) -> Vec<f64> {
        match self {
            Self::Values(values) => values.clone(),
            Self::Stepped { start, stop, step } => {
                let count = stepped_count(*start, *stop, *step).min(f64::from(MAX_RANGE_VALUES));
                (0..MAX_RANGE_VALUES)
                    .take_while(|k| f64::from(*k) < count)
                    .map(|k| start + f64::from(k) * step)
                    .collect()
            }
        }
    }
}

/// Number of values of a stepped range. A quotient within a relative
/// `STEP_TOLERANCE` of an integer counts as that integer, so `0 0.9 0.3`
/// stops before `0.9`.
fn stepped_count(start: f64, stop: f64, step: f64) -> f64 {
    let ratio = (stop - start) / step;
    if ratio.is_finite() && ratio > 0.0 && step > 0.0 {
        (ratio - ratio * STEP_TOLERANCE).ceil()
    } else {
        0.0
    }
}

// --- EXPANSION ---

/// Expands the input into one parameter set per group of the run.
///
/// Every output is `fixed ⊕ group ⊕ range values`, later overlays winning on
/// collisions. Positional and option entries declared in the same explicit
/// group stay paired; the product is taken across groups and range values.
///
/// Ordering: explicit groups vary fastest, then the first declared range,
/// then the next one, and so on.
pub fn expand(input: &ExpansionInput) -> Result<Vec<ParameterSet>, ExpansionError> {
    let mut seen_ranges = HashSet::new();
    for range in &input.ranges {
        if !seen_ranges.insert(range.name.as_str()) {
            return Err(ExpansionError::DuplicateRange(range.name.clone()));
        }
        validate_range(range, &format!("--{}", range.name))?;
    }

    let mut sets: Vec<ParameterSet> = if input.groups.is_empty() {
        vec![input.fixed.clone()]
    } else {
        input
            .groups
            .iter()
            .map(|group| input.fixed.overlay(group))
            .collect()
    };

    for range in &input.ranges {
        let values = range.spec.values();
        log::trace!(
            "Expanding range '--{}' with {} value(s) over {} set(s).",
            range.name,
            values.len(),
            sets.len()
        );
        sets = values
            .iter()
            .flat_map(|value| {
                sets.iter()
                    .map(move |set| set.clone().with_option(range.name.clone(), ParamValue::Float(*value)))
            })
            .collect();
    }

    for set in &sets {
        check_contiguous_positionals(set)?;
    }

    log::debug!("Expanded arguments into {} parameter set(s).", sets.len());
    Ok(sets)
}

// --- RUNNER PARAMETERS ---

/// Pulls `--n_threads` and `--submit_template` out of the fixed arguments.
///
/// These configure the runner and are never forwarded to the executable.
pub fn extract_runner_settings(
    fixed: ParameterSet,
) -> Result<(ParameterSet, RunnerSettings), ExpansionError> {
    let (fixed, threads) = fixed.without_option(RUNNER_PARAM_THREADS);
    let (fixed, template) = fixed.without_option(RUNNER_PARAM_TEMPLATE);

    let threads = threads
        .map(|value| {
            let raw = value.to_string();
            raw.parse::<usize>()
                .map_err(|_| ExpansionError::InvalidRunnerParameter {
                    name: RUNNER_PARAM_THREADS.to_string(),
                    value: raw,
                })
        })
        .transpose()?;

    Ok((
        fixed,
        RunnerSettings {
            threads,
            template: template.map(|v| v.to_string()),
        },
    ))
}

fn check_contiguous_positionals(set: &ParameterSet) -> Result<(), ExpansionError> {
    for (expected, (index, _)) in set.positional().enumerate() {
        if index != expected {
            return Err(ExpansionError::PositionalGap {
                missing: expected,
                present: index,
            });
        }
    }
    Ok(())
}
