//! Helpers for running external commands and privileged scripts.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

/// Run a shell one-liner, discarding output.
///
/// # Errors
///
/// Fails when the shell cannot be spawned; a nonzero exit is reported
/// as `Ok(false)`.
pub async fn run_shell(cmd: &str) -> std::io::Result<bool> {
    debug!(cmd, "running shell command");
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .status()
        .await?;
    Ok(status.success())
}

/// Run a shell one-liner and capture trimmed stdout.
///
/// # Errors
///
/// Fails when the shell cannot be spawned or exits nonzero.
pub async fn run_shell_capture(cmd: &str) -> std::io::Result<String> {
    debug!(cmd, "running shell command (capture)");
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::other(format!(
            "command `{cmd}` exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run a script file with positional arguments and return its stdout
/// split into lines. The exit status is not consulted; script results
/// are carried by sentinel lines in stdout.
///
/// # Errors
///
/// Fails when the script cannot be spawned.
pub async fn run_script(path: &Path, args: &[String]) -> std::io::Result<Vec<String>> {
    debug!(script = %path.display(), ?args, "running script");
    let output = Command::new("/bin/bash")
        .arg(path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect())
}
