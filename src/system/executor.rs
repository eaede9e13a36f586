// src/system/executor.rs

use crate::CancellationToken;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command as StdCommand, ExitStatus, Stdio};
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("No command specified to run.")]
    EmptyCommand,
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, std::io::Error),
    #[error("Command '{command}' exited with a non-zero status: {stderr}")]
    NonZeroExitStatus { command: String, stderr: String },
    #[error("Command '{command}' produced output that was not valid UTF-8")]
    InvalidUtf8Output {
        command: String,
        #[source]
        source: std::string::FromUtf8Error,
    },
    #[error("Could not prepare '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse the output of '{command}': {output}")]
    UnexpectedOutput { command: String, output: String },
    #[error("Could not start the worker pool: {0}")]
    Pool(String),
    #[error("Could not signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("Operation was cancelled by the user.")]
    Cancelled,
}

/// Returns `Err(Cancelled)` once the token has been set.
pub fn check_for_cancellation(token: &CancellationToken) -> Result<(), ExecutionError> {
    if token.load(Ordering::SeqCst) {
        Err(ExecutionError::Cancelled)
    } else {
        Ok(())
    }
}

fn split_program(argv: &[String]) -> Result<(&String, &[String]), ExecutionError> {
    argv.split_first().ok_or(ExecutionError::EmptyCommand)
}

fn display_argv(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
}

fn create_output_file(path: &Path) -> Result<File, ExecutionError> {
    File::create(path).map_err(|e| ExecutionError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

/// Spawns `argv` in `cwd` with stdout and stderr redirected to files.
/// Stdin is closed so experiments never wait on the terminal.
pub fn spawn_to_files(
    argv: &[String],
    cwd: &Path,
    stdout_path: &Path,
    stderr_path: &Path,
) -> Result<Child, ExecutionError> {
    let (program, args) = split_program(argv)?;
    let stdout = create_output_file(stdout_path)?;
    let stderr = create_output_file(stderr_path)?;

    log::debug!("Spawning '{}' in '{}'.", display_argv(argv), cwd.display());
    StdCommand::new(program)
        .args(args)
        .current_dir(dunce::simplified(cwd))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|e| ExecutionError::CommandFailed(display_argv(argv), e))
}

/// Waits for `child` to exit, polling the cancellation token.
///
/// When the token is set, the child is killed and reaped and `Cancelled` is
/// returned.
pub fn wait_with_cancellation(
    child: &mut Child,
    token: &CancellationToken,
) -> Result<ExitStatus, ExecutionError> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if check_for_cancellation(token).is_err() {
                    log::debug!(
                        "Cancellation requested, killing child process (PID: {})...",
                        child.id()
                    );
                    if let Err(e) = child.kill() {
                        log::warn!("Failed to kill child process {}: {}", child.id(), e);
                    }
                    child.wait().ok();
                    return Err(ExecutionError::Cancelled);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                return Err(ExecutionError::CommandFailed(format!("pid {}", child.id()), e));
            }
        }
    }
}

/// Executes a short command and captures its standard output.
///
/// Used for scheduler front-ends (`condor_submit`, `sbatch`, ...) and
/// metadata probes. A non-zero exit carries the command's stderr.
pub fn execute_and_capture_output(argv: &[String], cwd: &Path) -> Result<String, ExecutionError> {
    let (program, args) = split_program(argv)?;
    let command_line = display_argv(argv);
    log::debug!("Capturing output of '{}'.", command_line);

    let output = StdCommand::new(program)
        .args(args)
        .current_dir(dunce::simplified(cwd))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ExecutionError::CommandFailed(command_line.clone(), e))?;

    if !output.status.success() {
        return Err(ExecutionError::NonZeroExitStatus {
            command: command_line,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    String::from_utf8(output.stdout).map_err(|e| ExecutionError::InvalidUtf8Output {
        command: command_line,
        source: e,
    })
}

/// Returns the commit hash of the repository containing `cwd`, if any.
pub fn current_commit(cwd: &Path) -> Option<String> {
    let argv = ["git", "rev-parse", "HEAD"].map(String::from);
    match execute_and_capture_output(&argv, cwd) {
        Ok(out) => Some(out.trim().to_string()).filter(|s| !s.is_empty()),
        Err(e) => {
            log::debug!("No commit recorded: {}", e);
            None
        }
    }
}

/// Whether a process with `pid` is still alive.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = signalable_pid(pid) else {
        return false;
    };
    // EPERM: the process exists but belongs to someone else.
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

/// Liveness cannot be checked here; the recorded status is trusted.
#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

/// Sends SIGTERM to `pid`.
#[cfg(unix)]
pub fn terminate_process(pid: u32) -> Result<(), ExecutionError> {
    use nix::sys::signal::{Signal, kill};

    let target = signalable_pid(pid).ok_or_else(|| ExecutionError::Signal {
        pid,
        reason: "not a valid process id".to_string(),
    })?;
    kill(target, Signal::SIGTERM).map_err(|e| ExecutionError::Signal {
        pid,
        reason: e.to_string(),
    })
}

#[cfg(not(unix))]
pub fn terminate_process(pid: u32) -> Result<(), ExecutionError> {
    Err(ExecutionError::Signal {
        pid,
        reason: "signals are only supported on Unix".to_string(),
    })
}

/// Zero and negative ids address process groups and are never signalled.
#[cfg(unix)]
fn signalable_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}
