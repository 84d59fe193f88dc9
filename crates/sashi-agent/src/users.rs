//! Instance OS-user provisioning via the install/uninstall scripts.
//!
//! The scripts run privileged and own all user, quota, and cgroup
//! work. Their stdout is the contract: the last line is a sentinel
//! (`INST_SUC`/`INST_ERR`, `UNINST_SUC`/`UNINST_ERR`); on success the
//! first lines carry the new uid and username, on failure the first
//! line is an error string.

use std::path::Path;

use sashi_core::instance::{Ports, Resources};
use tracing::{error, info};

use crate::shell::run_script;

const INSTALL_OK: &str = "INST_SUC";
const INSTALL_ERR: &str = "INST_ERR";
const UNINSTALL_OK: &str = "UNINST_SUC";
const UNINSTALL_ERR: &str = "UNINST_ERR";

/// Run-as uid inside the container: the contract user.
pub const CONTRACT_UID: u32 = 10000;
/// Run-as gid inside the container: the sashimono group, so the
/// contract user inherits group permissions on the contract dir.
pub const CONTRACT_GID: u32 = 0;

/// A provisioned instance user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceUser {
    /// The new user's uid.
    pub uid: u32,
    /// The new user's name.
    pub username: String,
}

/// Create the instance user with its quotas and docker setup.
///
/// # Errors
///
/// Returns the script's error string when it reports failure, or an
/// explanation when its output cannot be understood.
#[allow(clippy::too_many_arguments)]
pub async fn install_user(
    script: &Path,
    resources: Resources,
    container_name: &str,
    ports: Ports,
    image_name: &str,
    registry_address: &str,
    outbound_ipv6: &str,
    outbound_net_interface: &str,
) -> Result<InstanceUser, String> {
    let args = vec![
        resources.cpu_us.to_string(),
        resources.mem_kbytes.to_string(),
        resources.swap_kbytes.to_string(),
        resources.storage_kbytes.to_string(),
        container_name.to_string(),
        CONTRACT_UID.to_string(),
        CONTRACT_GID.to_string(),
        ports.peer_port.to_string(),
        ports.user_port.to_string(),
        ports.gp_tcp_port_start.to_string(),
        ports.gp_udp_port_start.to_string(),
        image_name.to_string(),
        registry_address.to_string(),
        outbound_ipv6.to_string(),
        outbound_net_interface.to_string(),
    ];

    let lines = run_script(script, &args)
        .await
        .map_err(|e| format!("install script spawn failed: {e}"))?;
    parse_install_output(&lines).inspect(|user| {
        info!(username = %user.username, uid = user.uid, "created instance user");
    })
}

fn parse_install_output(lines: &[String]) -> Result<InstanceUser, String> {
    match lines.last().map(String::as_str) {
        Some(INSTALL_OK) => {
            let uid = lines
                .first()
                .and_then(|l| l.trim().parse::<u32>().ok())
                .ok_or_else(|| "install script reported an invalid uid".to_string())?;
            let username = lines
                .get(1)
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .ok_or_else(|| "install script reported no username".to_string())?;
            Ok(InstanceUser { uid, username })
        }
        Some(INSTALL_ERR) => {
            let detail = lines.first().cloned().unwrap_or_default();
            error!(detail, "user install failed");
            Err(detail)
        }
        _ => {
            let detail = lines.first().cloned().unwrap_or_default();
            error!(detail, "user install produced no sentinel");
            Err(format!("unrecognized install output: {detail}"))
        }
    }
}

/// Remove the instance user and everything the install created.
///
/// # Errors
///
/// Returns the script's error string when it reports failure.
pub async fn uninstall_user(
    script: &Path,
    username: &str,
    ports: Ports,
    container_name: &str,
) -> Result<(), String> {
    let args = vec![
        username.to_string(),
        ports.peer_port.to_string(),
        ports.user_port.to_string(),
        ports.gp_tcp_port_start.to_string(),
        ports.gp_udp_port_start.to_string(),
        container_name.to_string(),
    ];

    let lines = run_script(script, &args)
        .await
        .map_err(|e| format!("uninstall script spawn failed: {e}"))?;
    match lines.last().map(String::as_str) {
        Some(UNINSTALL_OK) => {
            info!(username, "removed instance user");
            Ok(())
        }
        Some(UNINSTALL_ERR) => {
            let detail = lines.first().cloned().unwrap_or_default();
            error!(detail, "user uninstall failed");
            Err(detail)
        }
        _ => {
            let detail = lines.first().cloned().unwrap_or_default();
            error!(detail, "user uninstall produced no sentinel");
            Err(format!("unrecognized uninstall output: {detail}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn install_success_parses_uid_and_username() {
        let user = parse_install_output(&lines(&["10045", "sashi10045", "INST_SUC"])).unwrap();
        assert_eq!(
            user,
            InstanceUser {
                uid: 10045,
                username: "sashi10045".to_string()
            }
        );
    }

    #[test]
    fn install_error_carries_script_detail() {
        let err = parse_install_output(&lines(&["quota setup failed", "INST_ERR"])).unwrap_err();
        assert_eq!(err, "quota setup failed");
    }

    #[test]
    fn install_without_sentinel_is_rejected() {
        assert!(parse_install_output(&lines(&["garbage"])).is_err());
        assert!(parse_install_output(&[]).is_err());
    }

    #[test]
    fn install_with_bad_uid_is_rejected() {
        assert!(parse_install_output(&lines(&["not-a-uid", "sashi1", "INST_SUC"])).is_err());
    }

    #[tokio::test]
    async fn end_to_end_against_stub_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let install = dir.path().join("user-install.sh");
        std::fs::write(
            &install,
            "#!/bin/bash\necho 10046\necho \"sashi$5\"\necho INST_SUC\n",
        )
        .unwrap();
        let uninstall = dir.path().join("user-uninstall.sh");
        std::fs::write(&uninstall, "#!/bin/bash\necho UNINST_SUC\n").unwrap();

        let ports = Ports {
            peer_port: 22861,
            user_port: 26201,
            gp_tcp_port_start: 36525,
            gp_udp_port_start: 39064,
        };
        let user = install_user(
            &install,
            Resources::default(),
            "c1",
            ports,
            "hp.latest-ubt.20.04",
            "registry.example.net",
            "",
            "",
        )
        .await
        .unwrap();
        assert_eq!(user.username, "sashic1");

        uninstall_user(&uninstall, &user.username, ports, "c1")
            .await
            .unwrap();
    }
}
