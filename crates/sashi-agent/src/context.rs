//! Filesystem layout of a deployed agent.

use std::path::PathBuf;

/// Well-known paths the daemon works with, derived from the data and
/// binary directories.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Root data directory (`/etc/sashimono` in production).
    pub data_dir: PathBuf,
    /// Binary directory holding scripts and the bundled docker cli.
    pub bin_dir: PathBuf,
    /// The daemon socket.
    pub socket_path: PathBuf,
    /// Instance database.
    pub db_path: PathBuf,
    /// Message-board database (read-only from this service).
    pub mb_db_path: PathBuf,
    /// Agent configuration file.
    pub config_path: PathBuf,
    /// Contract directory template copied for each new instance.
    pub contract_template_dir: PathBuf,
    /// User install script.
    pub user_install_script: PathBuf,
    /// User uninstall script.
    pub user_uninstall_script: PathBuf,
    /// Directory containing the bundled docker binary.
    pub docker_bin_dir: PathBuf,
}

impl AgentContext {
    /// Build the context for the given roots.
    #[must_use]
    pub fn new(data_dir: PathBuf, bin_dir: PathBuf) -> Self {
        Self {
            socket_path: data_dir.join("sa.sock"),
            db_path: data_dir.join("sa.sqlite"),
            mb_db_path: data_dir.join("mb-xahau").join("mb-xahau.sqlite"),
            config_path: data_dir.join("sa.cfg"),
            contract_template_dir: data_dir.join("contract_template"),
            user_install_script: bin_dir.join("user-install.sh"),
            user_uninstall_script: bin_dir.join("user-uninstall.sh"),
            docker_bin_dir: bin_dir.join("dockerbin"),
            data_dir,
            bin_dir,
        }
    }
}
