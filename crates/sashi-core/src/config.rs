//! On-disk configuration for the agent services.
//!
//! Two JSON documents live in the data directory: `sa.cfg`, the typed
//! agent configuration read at startup (and rewritten when the lease
//! amount is reconciled against the ledger), and `governance.cfg`, a
//! flat candidate-id → vote mapping that operators may edit while the
//! reconciler is running.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or persisting configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or written.
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but is not valid JSON of the expected shape.
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level agent configuration (`sa.cfg`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Config schema version.
    pub version: String,
    /// Ledger account and pricing settings.
    pub xrpl: XrplConfig,
    /// Host networking settings.
    pub networking: NetworkingConfig,
    /// Host resource ceilings shared across instances.
    pub system: SystemConfig,
    /// Instance defaults: initial port bases and advertised address.
    pub hp: HpConfig,
    /// Container runtime settings.
    pub docker: DockerConfig,
    /// Reconciler timing knobs.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Ledger account, server, and pricing settings.
///
/// Field names follow the legacy camelCase layout so existing config
/// files keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrplConfig {
    /// This host's ledger account address.
    pub address: String,
    /// Signing secret for the host account.
    pub secret: String,
    /// Governor (registry hook) account address.
    pub governor_address: String,
    /// Named ledger network, if not the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Primary websocket server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rippled_server: Option<String>,
    /// Fallback websocket servers tried in order on disconnect.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_rippled_servers: Vec<String>,
    /// Price per lease in ledger currency units.
    pub lease_amount: f64,
    /// Max extra fee (drops) the fee escalator may add to a submission.
    pub affordable_extra_fee: u64,
    /// Reputation contract account, when participating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation_address: Option<String>,
    /// Reputation contract signing secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reputation_secret: Option<String>,
}

/// Host networking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkingConfig {
    /// Outbound IPv6 assignment for instances.
    pub ipv6: Ipv6Config,
}

/// Outbound IPv6 subnet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ipv6Config {
    /// Subnet instances draw their outbound address from.
    #[serde(default)]
    pub subnet: String,
    /// Interface the subnet is routed on.
    #[serde(default)]
    pub interface: String,
}

/// Host resource ceilings; divided by `max_instance_count` to size one
/// instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Max concurrent non-destroyed instances.
    pub max_instance_count: u64,
    /// Total CPU microseconds for sale.
    pub max_cpu_us: u64,
    /// Total memory (KB) for sale.
    pub max_mem_kbytes: u64,
    /// Total swap (KB) for sale.
    pub max_swap_kbytes: u64,
    /// Total storage (KB) for sale.
    pub max_storage_kbytes: u64,
}

/// Instance defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpConfig {
    /// First peer port; allocations count up from here.
    pub init_peer_port: u16,
    /// First user port.
    pub init_user_port: u16,
    /// First general-purpose tcp base (pairs).
    pub init_gp_tcp_port: u16,
    /// First general-purpose udp base (pairs).
    pub init_gp_udp_port: u16,
    /// Externally visible address handed to tenants.
    pub host_address: String,
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Registry the install script pulls images from.
    pub registry_address: String,
    /// Image-name prefix restriction, when enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_prefix: Option<String>,
}

/// Reconciler timing knobs, all optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler tick interval.
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,
    /// Inter-ledger gap beyond which the ledger counts as halted.
    #[serde(default = "default_halt_timeout", with = "humantime_serde")]
    pub halt_timeout: Duration,
    /// Grace fraction of the observed halt duration.
    #[serde(default = "default_halt_threshold")]
    pub halt_threshold: f64,
    /// Orphan prune cadence.
    #[serde(default = "default_prune_interval", with = "humantime_serde")]
    pub prune_interval: Duration,
}

const fn default_tick() -> Duration {
    Duration::from_secs(2)
}

const fn default_halt_timeout() -> Duration {
    Duration::from_secs(60)
}

const fn default_halt_threshold() -> f64 {
    0.25
}

const fn default_prune_interval() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: default_tick(),
            halt_timeout: default_halt_timeout(),
            halt_threshold: default_halt_threshold(),
            prune_interval: default_prune_interval(),
        }
    }
}

impl AgentConfig {
    /// Load the config from `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file is unreadable or malformed; callers treat
    /// this as fatal at startup.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persist the config back to `path`, pretty-printed.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// A governance vote for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    /// Vote in support of the candidate.
    Support,
    /// Vote against the candidate.
    Reject,
}

/// The governance vote file: candidate id → vote.
///
/// Operators edit this file while the reconciler runs, so it is
/// re-read before every heartbeat rather than cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceFile {
    /// Votes keyed by candidate id. BTreeMap keeps file output stable.
    #[serde(flatten)]
    pub votes: BTreeMap<String, Vote>,
}

impl GovernanceFile {
    /// Load votes from `path`. A missing file means no votes.
    ///
    /// # Errors
    ///
    /// Fails when the file exists but cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Persist the votes back to `path`.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let raw = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Drop a candidate whose vote the hook rejected.
    pub fn remove(&mut self, candidate_id: &str) -> bool {
        self.votes.remove(candidate_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "version": "0.8.2",
            "xrpl": {
                "address": "rHostHostHostHostHostHostHostHos",
                "secret": "shSecretSecretSecretSecret",
                "governorAddress": "rGovGovGovGovGovGovGovGovGovGovG",
                "leaseAmount": 2.0,
                "affordableExtraFee": 10,
            },
            "networking": { "ipv6": { "subnet": "2001:db8::/64", "interface": "eth0" } },
            "system": {
                "max_instance_count": 3,
                "max_cpu_us": 900000,
                "max_mem_kbytes": 3145728,
                "max_swap_kbytes": 3145728,
                "max_storage_kbytes": 9437184,
            },
            "hp": {
                "init_peer_port": 22861,
                "init_user_port": 26201,
                "init_gp_tcp_port": 36525,
                "init_gp_udp_port": 39064,
                "host_address": "host.example.net",
            },
            "docker": { "registry_address": "registry.example.net" },
        })
    }

    #[test]
    fn parse_and_rewrite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.cfg");
        std::fs::write(&path, serde_json::to_vec(&sample()).unwrap()).unwrap();

        let mut cfg = AgentConfig::from_file(&path).unwrap();
        assert_eq!(cfg.xrpl.lease_amount, 2.0);
        assert_eq!(cfg.scheduler.tick, Duration::from_secs(2));
        assert_eq!(cfg.scheduler.halt_threshold, 0.25);

        // Lease-amount reconciliation rewrites the file.
        cfg.xrpl.lease_amount = 3.5;
        cfg.save(&path).unwrap();
        let reread = AgentConfig::from_file(&path).unwrap();
        assert_eq!(reread.xrpl.lease_amount, 3.5);
        assert_eq!(reread.xrpl.governor_address, cfg.xrpl.governor_address);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.cfg");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(AgentConfig::from_file(&path).is_err());
    }

    #[test]
    fn governance_file_roundtrip_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governance.cfg");

        // Missing file is an empty vote set.
        let mut gov = GovernanceFile::from_file(&path).unwrap();
        assert!(gov.votes.is_empty());

        gov.votes.insert("candidateA".into(), Vote::Support);
        gov.votes.insert("candidateB".into(), Vote::Reject);
        gov.save(&path).unwrap();

        let mut reread = GovernanceFile::from_file(&path).unwrap();
        assert_eq!(reread.votes.get("candidateA"), Some(&Vote::Support));
        assert!(reread.remove("candidateB"));
        assert!(!reread.remove("candidateB"));
    }
}
