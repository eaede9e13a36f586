// src/core/paths.rs

use crate::constants::{GROUP_DIR_PREFIX, QANAT_DIR, RUN_DIR_PREFIX};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PathError {
    #[error("Failed to expand path '{template}': {reason}")]
    Expansion { template: String, reason: String },
    #[error("No qanat project found in '{0}' or any of its parents (missing '.qanat' directory).")]
    ProjectNotFound(String),
}

/// Expands `~` and environment variables in `template`. Relative results are
/// anchored at `base`.
pub fn expand_path(template: &str, base: &Path) -> Result<PathBuf, PathError> {
    let expanded = shellexpand::full(template).map_err(|e| PathError::Expansion {
        template: template.to_string(),
        reason: e.to_string(),
    })?;
    let path = PathBuf::from(expanded.into_owned());
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(base.join(path))
    }
}

/// Walks up from `start` until a directory containing `.qanat/` is found.
pub fn find_project_root(start: &Path) -> Result<PathBuf, PathError> {
    let start = dunce::canonicalize(start).unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|dir| dir.join(QANAT_DIR).is_dir())
        .map(Path::to_path_buf)
        .ok_or_else(|| PathError::ProjectNotFound(start.display().to_string()))
}

pub fn experiment_dir(result_dir: &Path, experiment: &str) -> PathBuf {
    result_dir.join(experiment)
}

pub fn run_dir(experiment_dir: &Path, run_id: u64) -> PathBuf {
    experiment_dir.join(format!("{}{}", RUN_DIR_PREFIX, run_id))
}

pub fn group_dir_name(index: usize) -> String {
    format!("{}{}", GROUP_DIR_PREFIX, index)
}

/// Extracts the id from a `run_<id>` directory name.
pub fn parse_run_dir_name(name: &str) -> Option<u64> {
    name.strip_prefix(RUN_DIR_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_expand_path_anchors_relative_paths() {
        let base = Path::new("/project");
        assert_eq!(expand_path("results", base).unwrap(), PathBuf::from("/project/results"));
        assert_eq!(expand_path("/abs/results", base).unwrap(), PathBuf::from("/abs/results"));
    }

    #[test]
    fn test_find_project_root_walks_up() {
        // --- Setup ---
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(QANAT_DIR)).unwrap();
        let nested = dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        // --- Execute ---
        let root = find_project_root(&nested).unwrap();

        // --- Assert ---
        assert_eq!(root, dunce::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_run_dir_names() {
        assert_eq!(run_dir(Path::new("/r/exp"), 7), PathBuf::from("/r/exp/run_7"));
        assert_eq!(group_dir_name(3), "group_3");
        assert_eq!(parse_run_dir_name("run_12"), Some(12));
        assert_eq!(parse_run_dir_name("run_x"), None);
        assert_eq!(parse_run_dir_name("group_1"), None);
    }
}
