//! Per-instance hpfs filesystem service management.
//!
//! Each instance user runs an hpfs service under its own systemd user
//! manager. The daemon pushes the log level and history mode into the
//! service's environment file, then starts or stops the unit around
//! container transitions.

use nix::unistd::User;
use tracing::info;

use crate::shell::run_shell;

/// Name of the per-user hpfs systemd unit.
const HPFS_UNIT: &str = "sashimono-hpfs";

/// Valid hpfs log levels as they appear in `hp.cfg`.
pub const VALID_LOG_LEVELS: [&str; 4] = ["dbg", "inf", "wrn", "err"];

fn systemctl_user(username: &str, uid: u32, verb: &str) -> String {
    format!(
        "sudo -u {username} XDG_RUNTIME_DIR=/run/user/{uid} systemctl --user {verb} {HPFS_UNIT}"
    )
}

fn user_uid(username: &str) -> std::io::Result<u32> {
    User::from_name(username)
        .map_err(std::io::Error::other)?
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| std::io::Error::other(format!("no such user {username}")))
}

/// Rewrite the hpfs service environment for `username`.
///
/// # Errors
///
/// Fails when the environment file cannot be written.
pub fn update_service_conf(
    username: &str,
    log_level: &str,
    is_full_history: bool,
) -> std::io::Result<()> {
    let env_path = format!("/home/{username}/.serviceconf/{HPFS_UNIT}.env");
    if let Some(parent) = std::path::Path::new(&env_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = format!(
        "HPFS_TRACE={log_level}\nHPFS_MERGE={}\n",
        if is_full_history { "false" } else { "true" }
    );
    std::fs::write(&env_path, body)?;
    Ok(())
}

/// Start the hpfs unit for `username`.
///
/// # Errors
///
/// Fails when systemctl cannot be run or the unit fails to start.
pub async fn start(username: &str) -> std::io::Result<()> {
    let uid = user_uid(username)?;
    info!(username, "starting hpfs service");
    if !run_shell(&systemctl_user(username, uid, "start")).await? {
        return Err(std::io::Error::other(format!(
            "hpfs start failed for {username}"
        )));
    }
    Ok(())
}

/// Stop the hpfs unit for `username`.
///
/// # Errors
///
/// Fails when systemctl cannot be run or the unit fails to stop.
pub async fn stop(username: &str) -> std::io::Result<()> {
    let uid = user_uid(username)?;
    info!(username, "stopping hpfs service");
    if !run_shell(&systemctl_user(username, uid, "stop")).await? {
        return Err(std::io::Error::other(format!(
            "hpfs stop failed for {username}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemctl_command_targets_user_manager() {
        let cmd = systemctl_user("sashi10045", 10045, "start");
        assert_eq!(
            cmd,
            "sudo -u sashi10045 XDG_RUNTIME_DIR=/run/user/10045 systemctl --user start sashimono-hpfs"
        );
    }
}
