// tests/pipeline.rs

// End-to-end runs of the expand -> build -> store -> dispatch pipeline with
// the local runner, against a temporary project.

#![cfg(unix)]

use qanat::{
    CancellationToken,
    cli::handlers::{
        run::{RunContext, launch_run},
        status::build_report,
    },
    core::{
        config_loader::ProjectConfig,
        expander,
        paths,
        storage::{self, StorageError},
    },
    models::{ExpansionInput, GroupStatus, ParameterSet, RunnerKind},
    system::backend::DispatchOutcome,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::{TempDir, tempdir};

const EXPERIMENT_SCRIPT: &str = r#"echo "$@"
dir=""
cov=""
while [ $# -gt 0 ]; do
  case "$1" in
    --storage_path) dir="$2" ;;
    --cov) cov="$2" ;;
  esac
  shift
done
if [ "$cov" = "FAIL" ]; then
  echo "bad covariance" >&2
  exit 3
fi
printf 'count_total=4\n2\n2\n' > "$dir/progress.txt"
"#;

fn setup_project() -> (TempDir, ProjectConfig) {
    let dir = tempdir().unwrap();
    fs::create_dir(dir.path().join(".qanat")).unwrap();
    fs::write(dir.path().join("gaussian.sh"), EXPERIMENT_SCRIPT).unwrap();
    fs::write(
        dir.path().join(".qanat").join("qanat.toml"),
        r#"
result_dir = "results"

[[experiments]]
name = "gaussian"
executable = "gaussian.sh"
executable_command = "sh"
"#,
    )
    .unwrap();
    let config = ProjectConfig::load(dir.path()).unwrap();
    (dir, config)
}

fn token() -> CancellationToken {
    Arc::new(AtomicBool::new(false))
}

fn context(input: ExpansionInput, threads: usize) -> RunContext {
    RunContext {
        experiment: "gaussian".to_string(),
        input,
        runner: Some(RunnerKind::Local),
        threads: Some(threads),
        ..Default::default()
    }
}

fn experiment_dir(root: &Path) -> PathBuf {
    root.join("results").join("gaussian")
}

#[test]
fn test_groups_and_range_produce_paired_commands() {
    // --- Setup ---
    let (dir, config) = setup_project();
    let fixed = expander::parse_cli_tokens(&["--mean", "10,-50"], 0).unwrap();
    let input = ExpansionInput {
        groups: vec![
            expander::parse_group_declaration("10 --cov A", 0).unwrap(),
            expander::parse_group_declaration("10 500 --cov B", 0).unwrap(),
        ],
        ranges: vec![expander::parse_range_declaration("--n_samples 5 205 100").unwrap()],
        fixed,
    };

    // --- Execute ---
    let summary = launch_run(context(input, 2), &config, &token()).unwrap();

    // --- Assert ---
    assert_eq!(summary.run_id, 1);
    assert_eq!(summary.outcomes.len(), 4);
    assert!(summary.outcomes.iter().all(|o| o.status() == GroupStatus::Finished));

    let run_dir = experiment_dir(dir.path()).join("run_1");
    let expected = [
        ("10 --mean 10,-50 --cov A", "--n_samples 5.0"),
        ("10 500 --mean 10,-50 --cov B", "--n_samples 5.0"),
        ("10 --mean 10,-50 --cov A", "--n_samples 105.0"),
        ("10 500 --mean 10,-50 --cov B", "--n_samples 105.0"),
    ];
    for (index, (head, samples)) in expected.iter().enumerate() {
        let group_dir = run_dir.join(format!("group_{}", index));
        let stdout = fs::read_to_string(group_dir.join("stdout.txt")).unwrap();
        assert!(stdout.starts_with(head), "group {}: {}", index, stdout);
        assert!(stdout.contains(samples), "group {}: {}", index, stdout);
        assert!(stdout.contains(&format!("--storage_path {}", group_dir.display())));

        let info = storage::read_group_info(&group_dir).unwrap();
        assert_eq!(info.parameter("pos_0"), Some("10"));
        assert!(info.command.contains("gaussian.sh"));
    }

    let record = storage::load_run_record(&run_dir).unwrap();
    assert_eq!(record.groups.len(), 4);
    assert_eq!(record.runner, RunnerKind::Local);
    assert_eq!(record.main_pid, Some(std::process::id()));
    assert!(record.ended.is_some());
    assert!(record.groups.iter().all(|g| g.handle.is_some() && g.finished.is_some()));
}

#[test]
fn test_single_group_run_stores_in_run_dir() {
    // --- Setup ---
    let (dir, config) = setup_project();
    let input = ExpansionInput {
        fixed: expander::parse_cli_tokens(&["7", "--cov", "A"], 0).unwrap(),
        ..Default::default()
    };

    // --- Execute ---
    let summary = launch_run(context(input, 1), &config, &token()).unwrap();

    // --- Assert ---
    let run_dir = experiment_dir(dir.path()).join("run_1");
    assert_eq!(summary.run_dir, run_dir);
    assert!(run_dir.join("stdout.txt").is_file());
    assert!(run_dir.join("group_info.yaml").is_file());
    assert!(run_dir.join("info.yaml").is_file());
    assert!(!run_dir.join("group_0").exists());

    let record = storage::load_run_record(&run_dir).unwrap();
    assert_eq!(record.groups[0].storage_path, run_dir);
}

#[test]
fn test_run_directories_are_never_reused() {
    // --- Setup ---
    let (dir, config) = setup_project();
    let exp_dir = experiment_dir(dir.path());

    // --- Execute ---
    let first = launch_run(context(ExpansionInput::default(), 1), &config, &token()).unwrap();
    let second = launch_run(context(ExpansionInput::default(), 1), &config, &token()).unwrap();
    let reused = storage::create_run_layout(&paths::run_dir(&exp_dir, first.run_id), 1);

    // --- Assert ---
    assert_eq!((first.run_id, second.run_id), (1, 2));
    assert!(matches!(reused, Err(StorageError::RunExists(_))));
    assert_eq!(storage::list_runs(&exp_dir).unwrap().len(), 2);
}

#[test]
fn test_status_report_reads_progress_and_failures() {
    // --- Setup ---
    let (_dir, config) = setup_project();
    let input = ExpansionInput {
        groups: vec![
            ParameterSet::new().with_option("cov", qanat::models::ParamValue::text("A")),
            ParameterSet::new().with_option("cov", qanat::models::ParamValue::text("FAIL")),
        ],
        ..Default::default()
    };

    // --- Execute ---
    let summary = launch_run(context(input, 1), &config, &token()).unwrap();
    let record = storage::load_run_record(&summary.run_dir).unwrap();
    let report = build_report(&record, &token());

    // --- Assert ---
    assert_eq!(
        summary.outcomes.iter().map(DispatchOutcome::status).collect::<Vec<_>>(),
        vec![GroupStatus::Finished, GroupStatus::Failed]
    );
    assert_eq!(report.status, GroupStatus::Failed);
    assert_eq!(report.groups[0].progress, Some(100.0));
    assert_eq!(report.groups[1].progress, None);
    assert_eq!(report.progress, Some(100.0));

    let stderr = fs::read_to_string(summary.run_dir.join("group_1").join("stderr.txt")).unwrap();
    assert_eq!(stderr.trim(), "bad covariance");
}

#[test]
fn test_count_total_progress_of_a_running_group() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("progress.txt"), "count_total=4\n2\nepo").unwrap();
    let progress = qanat::core::progress::read_group_progress(dir.path());
    assert_eq!(progress.percent(), Some(50.0));
}
