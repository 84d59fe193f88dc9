//! Contract directory materialization and `hp.cfg` manipulation.
//!
//! A new instance gets a copy of the contract template, staged under
//! `/tmp` so a crashed workflow self-cleans on reboot, with its
//! `cfg/hp.cfg` rewritten for the instance (fresh node signing keys,
//! contract id, seeded unl, assigned ports) before the directory is
//! moved into the instance user's home and handed over.

use std::path::{Path, PathBuf};

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use sashi_core::instance::Ports;
use sashi_core::message::ConfigOverrides;
use serde_json::{json, Value};
use tracing::info;

use crate::hpfs::VALID_LOG_LEVELS;
use crate::shell::run_shell;
use crate::users::{CONTRACT_GID, CONTRACT_UID};

/// Node signing keypair written into a new instance's config.
#[derive(Debug, Clone)]
pub struct NodeKeys {
    /// Hex public key with the `ed` scheme prefix.
    pub public_key: String,
    /// Hex private key with the `ed` scheme prefix.
    pub private_key: String,
}

/// Generate a fresh ed25519 node keypair, hex-encoded the way hp.cfg
/// expects.
#[must_use]
pub fn generate_node_keys() -> NodeKeys {
    let signing = SigningKey::generate(&mut OsRng);
    NodeKeys {
        public_key: format!("ed{}", hex::encode(signing.verifying_key().as_bytes())),
        private_key: format!("ed{}", hex::encode(signing.to_bytes())),
    }
}

/// Stage a contract directory copy with a rewritten `hp.cfg`.
///
/// Returns the staging path and the generated node keys. The caller
/// moves the staging dir into place and transfers ownership.
///
/// # Errors
///
/// Fails when the template cannot be copied or the config cannot be
/// rewritten.
pub fn stage_contract_dir(
    template_dir: &Path,
    owner_pubkey: &str,
    contract_id: &str,
    ports: Ports,
) -> std::io::Result<(PathBuf, NodeKeys)> {
    #[allow(deprecated)] // into_path keeps 3.x-wide compatibility
    let staging = tempfile::Builder::new()
        .prefix("sashi")
        .tempdir_in("/tmp")?
        .into_path();
    copy_dir_recursive(template_dir, &staging)?;

    let config_path = staging.join("cfg").join("hp.cfg");
    let raw = std::fs::read(&config_path)?;
    let mut doc: Value = serde_json::from_slice(&raw).map_err(std::io::Error::other)?;

    let keys = generate_node_keys();
    doc["node"]["public_key"] = json!(keys.public_key);
    doc["node"]["private_key"] = json!(keys.private_key);
    doc["contract"]["id"] = json!(contract_id);
    doc["contract"]["run_as"] = json!(format!("{CONTRACT_UID}:{CONTRACT_GID}"));
    doc["contract"]["unl"] = json!([keys.public_key]);
    doc["contract"]["bin_path"] = json!("bootstrap_contract");
    doc["contract"]["bin_args"] = json!(owner_pubkey);
    doc["mesh"]["port"] = json!(ports.peer_port);
    doc["user"]["port"] = json!(ports.user_port);
    doc["hpfs"]["external"] = json!(true);

    std::fs::write(&config_path, serde_json::to_vec_pretty(&doc)?)?;
    Ok((staging, keys))
}

/// Move a staged contract dir into place and hand it to the instance
/// user. The group keeps write access so the contract user can write
/// into it.
///
/// # Errors
///
/// Fails when the move or ownership transfer fails.
pub async fn install_contract_dir(
    staging: &Path,
    contract_dir: &str,
    username: &str,
) -> std::io::Result<()> {
    let mv = format!("mv {} {}", staging.display(), contract_dir);
    if !run_shell(&mv).await? {
        return Err(std::io::Error::other(format!(
            "moving contract dir to {contract_dir} failed"
        )));
    }
    let chown = format!("chown -R {username}:{username} {contract_dir}");
    let chmod = format!("chmod -R 0775 {contract_dir}");
    if !run_shell(&chown).await? || !run_shell(&chmod).await? {
        return Err(std::io::Error::other(format!(
            "contract dir ownership transfer failed for {contract_dir}"
        )));
    }
    info!(contract_dir, username, "contract directory installed");
    Ok(())
}

/// Home-relative contract dir for an instance user.
#[must_use]
pub fn user_contract_dir(username: &str, container_name: &str) -> String {
    format!("/home/{username}/{container_name}/contract")
}

/// Merge tenant config overrides into an `hp.cfg` document.
///
/// Absent fields leave the template value untouched; invalid values
/// reject the whole message.
///
/// # Errors
///
/// Returns a description of the first invalid override.
#[allow(clippy::too_many_lines)]
pub fn apply_overrides(doc: &mut Value, cfg: &ConfigOverrides) -> Result<(), String> {
    // Contract section.
    if !cfg.contract.unl.is_empty() {
        doc["contract"]["unl"] = json!(cfg.contract.unl);
    }
    if let Some(execute) = cfg.contract.execute {
        doc["contract"]["execute"] = json!(execute);
    }
    if let Some(env) = &cfg.contract.environment {
        doc["contract"]["environment"] = env.clone();
    }
    if let Some(v) = cfg.contract.max_input_ledger_offset {
        doc["contract"]["max_input_ledger_offset"] = json!(v);
    }
    if let Some(mode) = &cfg.contract.consensus.mode {
        doc["contract"]["consensus"]["mode"] = json!(mode);
    }
    if let Some(v) = cfg.contract.consensus.roundtime {
        doc["contract"]["consensus"]["roundtime"] = json!(v);
    }
    if let Some(v) = cfg.contract.consensus.stage_slice {
        doc["contract"]["consensus"]["stage_slice"] = json!(v);
    }
    if let Some(v) = cfg.contract.consensus.threshold {
        doc["contract"]["consensus"]["threshold"] = json!(v);
    }
    if let Some(mode) = &cfg.contract.npl.mode {
        doc["contract"]["npl"]["mode"] = json!(mode);
    }
    let rl = &cfg.contract.round_limits;
    for (key, value) in [
        ("user_input_bytes", rl.user_input_bytes),
        ("user_output_bytes", rl.user_output_bytes),
        ("npl_output_bytes", rl.npl_output_bytes),
        ("proc_cpu_seconds", rl.proc_cpu_seconds),
        ("proc_mem_bytes", rl.proc_mem_bytes),
        ("proc_ofd_count", rl.proc_ofd_count),
        ("exec_timeout", rl.exec_timeout),
    ] {
        if let Some(v) = value {
            doc["contract"]["round_limits"][key] = json!(v);
        }
    }
    if let Some(v) = cfg.contract.log.max_mbytes_per_file {
        doc["contract"]["log"]["max_mbytes_per_file"] = json!(v);
    }
    if let Some(v) = cfg.contract.log.max_file_count {
        doc["contract"]["log"]["max_file_count"] = json!(v);
    }

    // Node section.
    if let Some(role) = &cfg.node.role {
        if role != "observer" && role != "validator" {
            return Err("invalid role value observer|validator".to_string());
        }
        doc["node"]["role"] = json!(role);
    }
    if let Some(history) = &cfg.node.history {
        if history != "full" && history != "custom" {
            return Err("invalid history value full|custom".to_string());
        }
        doc["node"]["history"] = json!(history);
    }
    if let Some(v) = cfg.node.history_config.max_primary_shards {
        doc["node"]["history_config"]["max_primary_shards"] = json!(v);
    }
    if let Some(v) = cfg.node.history_config.max_raw_shards {
        doc["node"]["history_config"]["max_raw_shards"] = json!(v);
    }
    if doc["node"]["history"].as_str() == Some("custom")
        && doc["node"]["history_config"]["max_primary_shards"].as_u64() == Some(0)
    {
        return Err("'max_primary_shards' cannot be zero in history=custom mode".to_string());
    }

    // Mesh section.
    let mesh = &cfg.mesh;
    if let Some(v) = mesh.idle_timeout {
        doc["mesh"]["idle_timeout"] = json!(v);
    }
    if !mesh.known_peers.is_empty() {
        doc["mesh"]["known_peers"] = json!(mesh.known_peers);
    }
    if let Some(v) = mesh.msg_forwarding {
        doc["mesh"]["msg_forwarding"] = json!(v);
    }
    for (key, value) in [
        ("max_connections", mesh.max_connections),
        ("max_known_connections", mesh.max_known_connections),
        ("max_in_connections_per_host", mesh.max_in_connections_per_host),
        ("max_bytes_per_msg", mesh.max_bytes_per_msg),
        ("max_bytes_per_min", mesh.max_bytes_per_min),
        ("max_bad_msgs_per_min", mesh.max_bad_msgs_per_min),
        ("max_bad_msgsigs_per_min", mesh.max_bad_msgsigs_per_min),
        ("max_dup_msgs_per_min", mesh.max_dup_msgs_per_min),
    ] {
        if let Some(v) = value {
            doc["mesh"][key] = json!(v);
        }
    }
    if let Some(v) = mesh.peer_discovery.enabled {
        doc["mesh"]["peer_discovery"]["enabled"] = json!(v);
    }
    if let Some(v) = mesh.peer_discovery.interval {
        doc["mesh"]["peer_discovery"]["interval"] = json!(v);
    }

    // User section.
    let user = &cfg.user;
    for (key, value) in [
        ("idle_timeout", user.idle_timeout),
        ("max_bytes_per_msg", user.max_bytes_per_msg),
        ("max_bytes_per_min", user.max_bytes_per_min),
        ("max_bad_msgs_per_min", user.max_bad_msgs_per_min),
        ("max_connections", user.max_connections),
        ("max_in_connections_per_host", user.max_in_connections_per_host),
        ("concurrent_read_requests", user.concurrent_read_requests),
    ] {
        if let Some(v) = value {
            doc["user"][key] = json!(v);
        }
    }

    // Hpfs section.
    if let Some(level) = &cfg.hpfs.log.log_level {
        doc["hpfs"]["log"]["log_level"] = json!(level);
    }

    // Log section.
    if let Some(level) = &cfg.log.log_level {
        doc["log"]["log_level"] = json!(level);
    }
    if let Some(v) = cfg.log.max_mbytes_per_file {
        doc["log"]["max_mbytes_per_file"] = json!(v);
    }
    if let Some(v) = cfg.log.max_file_count {
        doc["log"]["max_file_count"] = json!(v);
    }
    if !cfg.log.loggers.is_empty() {
        doc["log"]["loggers"] = json!(cfg.log.loggers);
    }

    Ok(())
}

/// The hpfs settings a start needs, validated.
///
/// # Errors
///
/// Returns a description when the log level or history mode is not one
/// of the accepted values.
pub fn read_fs_settings(doc: &Value) -> Result<(String, bool), String> {
    let log_level = doc["hpfs"]["log"]["log_level"]
        .as_str()
        .ok_or_else(|| "missing hpfs log level".to_string())?;
    if !VALID_LOG_LEVELS.contains(&log_level) {
        return Err("invalid hpfs loglevel, valid values: dbg|inf|wrn|err".to_string());
    }

    let is_full_history = match doc["node"]["history"].as_str() {
        Some("full") => true,
        Some("custom") => false,
        _ => return Err("invalid history mode, 'full' or 'custom' expected".to_string()),
    };

    Ok((log_level.to_string(), is_full_history))
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template_doc() -> Value {
        json!({
            "contract": {
                "id": "",
                "unl": [],
                "consensus": { "mode": "public", "roundtime": 1000 },
                "round_limits": { "user_input_bytes": 0 },
                "log": {},
            },
            "node": { "public_key": "", "private_key": "", "role": "validator",
                      "history": "custom", "history_config": { "max_primary_shards": 4 } },
            "mesh": { "port": 0, "peer_discovery": {} },
            "user": { "port": 0 },
            "hpfs": { "log": { "log_level": "inf" } },
            "log": { "log_level": "inf" },
        })
    }

    fn write_template(dir: &Path) {
        std::fs::create_dir_all(dir.join("cfg")).unwrap();
        std::fs::write(
            dir.join("cfg").join("hp.cfg"),
            serde_json::to_vec_pretty(&template_doc()).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.join("bootstrap_contract"), b"#!/bin/sh\n").unwrap();
    }

    #[test]
    fn node_keys_are_hex_with_scheme_prefix() {
        let keys = generate_node_keys();
        assert!(keys.public_key.starts_with("ed"));
        assert_eq!(keys.public_key.len(), 2 + 64);
        assert_eq!(keys.private_key.len(), 2 + 64);
        assert!(hex::decode(&keys.public_key[2..]).is_ok());
    }

    #[test]
    fn staged_config_is_rewritten_for_the_instance() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("contract_template");
        write_template(&template);

        let ports = Ports {
            peer_port: 22861,
            user_port: 26201,
            gp_tcp_port_start: 36525,
            gp_udp_port_start: 39064,
        };
        let (staging, keys) = stage_contract_dir(
            &template,
            "edOWNER",
            "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b",
            ports,
        )
        .unwrap();

        let doc: Value =
            serde_json::from_slice(&std::fs::read(staging.join("cfg/hp.cfg")).unwrap()).unwrap();
        assert_eq!(doc["node"]["public_key"], json!(keys.public_key));
        assert_eq!(doc["contract"]["id"], json!("7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b"));
        assert_eq!(doc["contract"]["run_as"], json!("10000:0"));
        assert_eq!(doc["contract"]["unl"], json!([keys.public_key]));
        assert_eq!(doc["contract"]["bin_args"], json!("edOWNER"));
        assert_eq!(doc["mesh"]["port"], json!(22861));
        assert_eq!(doc["user"]["port"], json!(26201));
        assert_eq!(doc["hpfs"]["external"], json!(true));
        // Non-config template files came along.
        assert!(staging.join("bootstrap_contract").exists());

        std::fs::remove_dir_all(staging).unwrap();
    }

    #[test]
    fn overrides_merge_without_touching_absent_fields() {
        let mut doc = template_doc();
        let cfg: ConfigOverrides = serde_json::from_value(json!({
            "contract": { "consensus": { "roundtime": 2000 } },
            "mesh": { "msg_forwarding": true },
        }))
        .unwrap();
        apply_overrides(&mut doc, &cfg).unwrap();
        assert_eq!(doc["contract"]["consensus"]["roundtime"], json!(2000));
        assert_eq!(doc["contract"]["consensus"]["mode"], json!("public"));
        assert_eq!(doc["mesh"]["msg_forwarding"], json!(true));
    }

    #[test]
    fn invalid_role_is_rejected() {
        let mut doc = template_doc();
        let cfg: ConfigOverrides =
            serde_json::from_value(json!({ "node": { "role": "leader" } })).unwrap();
        assert!(apply_overrides(&mut doc, &cfg).is_err());
    }

    #[test]
    fn custom_history_requires_primary_shards() {
        let mut doc = template_doc();
        let cfg: ConfigOverrides = serde_json::from_value(json!({
            "node": { "history": "custom", "history_config": { "max_primary_shards": 0 } }
        }))
        .unwrap();
        assert!(apply_overrides(&mut doc, &cfg).is_err());
    }

    #[test]
    fn fs_settings_validate_level_and_history() {
        let doc = template_doc();
        let (level, full) = read_fs_settings(&doc).unwrap();
        assert_eq!(level, "inf");
        assert!(!full);

        let mut bad = template_doc();
        bad["hpfs"]["log"]["log_level"] = json!("verbose");
        assert!(read_fs_settings(&bad).is_err());

        let mut bad = template_doc();
        bad["node"]["history"] = json!("forever");
        assert!(read_fs_settings(&bad).is_err());
    }
}
