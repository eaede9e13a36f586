//! # System Interaction Layer
//!
//! Everything that touches processes, schedulers and OS signals.
//!
//! ## Modules
//!
//! - **`executor`**: spawns and waits on child processes, honoring the
//!   cancellation token, and captures the output of short commands.
//! - **`backend`**: the `ExecutionBackend` trait shared by every runner and the
//!   dispatch observer that records lifecycle events.
//! - **`local`**, **`htcondor`**, **`slurm`**: the three runners.
//! - **`signals`**: turns `Ctrl+C` and `SIGTERM` into the cancellation token.

pub mod backend;
pub mod executor;
pub mod htcondor;
pub mod local;
pub mod signals;
pub mod slurm;

use executor::ExecutionError;
use std::fs;
use std::path::Path;

/// Writes a job script and marks it executable (0o755 on Unix).
pub(crate) fn write_job_script(path: &Path, content: &str) -> Result<(), ExecutionError> {
    let io_error = |e| ExecutionError::Io {
        path: path.display().to_string(),
        source: e,
    };
    fs::write(path, content).map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(io_error)?;
    }
    Ok(())
}

/// Quotes a path for inclusion in a shell script.
pub(crate) fn shell_quote(path: &Path) -> String {
    let raw = path.display().to_string();
    let quoted = shlex::try_quote(&raw).map(|q| q.into_owned());
    quoted.unwrap_or(raw)
}
