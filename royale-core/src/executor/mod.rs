//! Local trial execution.
//!
//! Each trial runs one child process: the trial input is written to the
//! child's stdin as a single JSON document, stdout and stderr are captured
//! to completion, and the termination is classified into a terminal
//! [`TrialStatus`]:
//!
//! - a system error (search, spawn, pipe, timeout) yields
//!   `Error(ErrorCode)`;
//! - a non-zero exit yields `Error(ExitStatus)`;
//! - a zero exit whose stdout parses as a [`TrialOutput`](crate::trial::TrialOutput)
//!   yields `Complete`;
//! - a zero exit whose stdout does not parse yields `Error(BadOutput)`.
//!
//! The executor never propagates a child I/O failure to its caller; the only
//! error it can return is a failure to serialize the trial input itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

use crate::experiment::Experiment;
use crate::trial::{ErrorKind, Trial, TrialStatus};

/// Runs `trial` under `exp`'s command and classifies the outcome into a
/// terminal status.
pub async fn exec_trial(exp: &Experiment, mut trial: Trial) -> Result<Trial> {
    let input_doc = serde_json::to_vec(&trial.input)?;
    trial.status = TrialStatus::InProgress {};

    info!(experiment = %exp.name, cmd = ?exp.cmd, "running trial command");

    let cd = if exp.cd.is_empty() { "." } else { exp.cd.as_str() };
    let Some(program) = resolve_command(&exp.cmd, Path::new(cd)) else {
        let what = exp.cmd.first().map(String::as_str).unwrap_or("");
        trial.status = TrialStatus::Error(ErrorKind::ErrorCode {
            value: 2,
            message: format!("{what}: not found in search path"),
            category: "search".to_string(),
            stdout: String::new(),
            stderr: String::new(),
        });
        return Ok(trial);
    };
    debug!(program = %program.display(), "resolved trial command");

    let mut child = match Command::new(&program)
        .args(&exp.cmd[1..])
        .current_dir(cd)
        .envs(&exp.env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            trial.status = TrialStatus::Error(system_error(&err));
            return Ok(trial);
        }
    };

    // Write stdin and drain both output pipes concurrently with the exit
    // wait; a child that fills a pipe buffer must not deadlock the capture.
    let mut stdin_pipe = child.stdin.take();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let write_stdin = async {
        if let Some(mut pipe) = stdin_pipe.take() {
            let _ = pipe.write_all(&input_doc).await;
            let _ = pipe.shutdown().await;
        }
    };
    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let supervise = async {
        let (status, stdout, stderr, ()) =
            tokio::join!(child.wait(), read_stdout, read_stderr, write_stdin);
        (status, stdout, stderr)
    };

    let outcome = if exp.timeout > 0.0 {
        let bounded =
            tokio::time::timeout(Duration::from_secs_f64(exp.timeout), supervise).await;
        match bounded {
            Ok(outcome) => Some(outcome),
            Err(_) => None,
        }
    } else {
        Some(supervise.await)
    };

    let Some((status, stdout, stderr)) = outcome else {
        let _ = child.kill().await;
        info!(experiment = %exp.name, timeout = exp.timeout, "trial timed out");
        trial.status = TrialStatus::Error(ErrorKind::ErrorCode {
            value: 0,
            message: format!("timed out after {}s", exp.timeout),
            category: "timeout".to_string(),
            stdout: String::new(),
            stderr: String::new(),
        });
        return Ok(trial);
    };
    trial.status = match status {
        Err(err) => TrialStatus::Error(merge_streams(system_error(&err), stdout, stderr)),
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            info!(experiment = %exp.name, code, "trial command exited");
            debug!(stdout = %stdout, stderr = %stderr, "captured trial output");
            if code != 0 {
                TrialStatus::Error(ErrorKind::ExitStatus {
                    code,
                    stdout,
                    stderr,
                })
            } else {
                match serde_json::from_str(&stdout) {
                    Ok(output) => TrialStatus::Complete { output, stderr },
                    Err(_) => TrialStatus::Error(ErrorKind::BadOutput { stdout, stderr }),
                }
            }
        }
    };

    Ok(trial)
}

fn system_error(err: &std::io::Error) -> ErrorKind {
    ErrorKind::ErrorCode {
        value: err.raw_os_error().unwrap_or(-1),
        message: err.to_string(),
        category: "system".to_string(),
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn merge_streams(kind: ErrorKind, stdout: String, stderr: String) -> ErrorKind {
    match kind {
        ErrorKind::ErrorCode {
            value,
            message,
            category,
            ..
        } => ErrorKind::ErrorCode {
            value,
            message,
            category,
            stdout,
            stderr,
        },
        other => other,
    }
}

/// Resolves `cmd[0]` against the current search path extended by `cd`.
/// Path-qualified commands bypass the search.
fn resolve_command(cmd: &[String], cd: &Path) -> Option<PathBuf> {
    let program = cmd.first()?;
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let extra = std::env::current_dir().ok()?.join(cd);
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .chain(std::iter::once(extra))
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
