// src/constants.rs

/// The name of the directory marking a qanat project root.
pub const QANAT_DIR: &str = ".qanat";

/// The name of the project configuration file (inside .qanat/).
pub const PROJECT_CONFIG_FILENAME: &str = "qanat.toml";

/// Default directory for run storage, relative to the project root.
pub const DEFAULT_RESULT_DIR: &str = "results";

/// Per-experiment counter file holding the last allocated run id.
pub const RUN_COUNTER_FILENAME: &str = ".run_counter";

/// Prefix of run directories (`run_<id>`).
pub const RUN_DIR_PREFIX: &str = "run_";

/// Prefix of group subdirectories in multi-group runs (`group_<i>`).
pub const GROUP_DIR_PREFIX: &str = "group_";

/// Per-run metadata record.
pub const RUN_INFO_FILENAME: &str = "info.yaml";

/// Per-group metadata record.
pub const GROUP_INFO_FILENAME: &str = "group_info.yaml";

/// Progress marker written by the experiment executable.
pub const PROGRESS_FILENAME: &str = "progress.txt";

pub const STDOUT_FILENAME: &str = "stdout.txt";
pub const STDERR_FILENAME: &str = "stderr.txt";

/// HTCondor user event log, one per group.
pub const HTCONDOR_LOG_FILENAME: &str = "log.txt";
pub const HTCONDOR_EXECUTABLE_FILENAME: &str = "executable.sh";
pub const HTCONDOR_SUBMIT_FILENAME: &str = "job.sub";

pub const SLURM_SCRIPT_FILENAME: &str = "slurm_job.sh";
/// Lifecycle markers appended by the Slurm job script.
pub const SLURM_EVENTS_FILENAME: &str = "slurm_events.txt";

/// Runner parameters that may be passed among the fixed arguments and are
/// consumed by qanat instead of the executable.
pub const RUNNER_PARAM_THREADS: &str = "n_threads";
pub const RUNNER_PARAM_TEMPLATE: &str = "submit_template";

/// Name of the template used when none is selected explicitly.
pub const DEFAULT_TEMPLATE_NAME: &str = "default";

/// Upper bound on the number of values a single stepped range may produce.
pub const MAX_RANGE_VALUES: u32 = 1_000_000;
