//! Socket message envelope for the lifecycle daemon.
//!
//! Requests are a single JSON object `{"type": <string>, ...fields}`.
//! Replies are `{"type": "<op>_res" | "<op>_error", "content": ...}`
//! where error content is the machine-readable kind string. A special
//! `initiate_error` reply reports a create that succeeded up to the
//! post-create config/start step; the daemon has already rolled the
//! instance back when this is sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instance::Instance;

/// Inbound daemon request, tagged by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// List all non-destroyed instances joined with their lease rows.
    List,
    /// Create and start a new instance.
    Create(Box<CreateRequest>),
    /// Destroy an instance and free its resources.
    Destroy {
        /// Instance to destroy.
        container_name: String,
    },
    /// Start a stopped instance.
    Start {
        /// Instance to start.
        container_name: String,
    },
    /// Stop a running instance.
    Stop {
        /// Instance to stop.
        container_name: String,
    },
    /// Fetch one instance row (used by the CLI to build attach commands).
    Inspect {
        /// Instance to inspect.
        container_name: String,
    },
}

/// Fields of a `create` request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    /// Name for the new container; the lease token id when the
    /// reconciler is the caller.
    pub container_name: String,
    /// Tenant public key, passed through to the contract.
    pub owner_pubkey: String,
    /// Contract id (must be a uuid).
    pub contract_id: String,
    /// Docker image. A `--` suffix is stripped before the runtime sees
    /// it.
    pub image: String,
    /// Outbound IPv6 address for the instance, if assigned.
    #[serde(default)]
    pub outbound_ipv6: String,
    /// Network interface carrying the outbound address.
    #[serde(default)]
    pub outbound_net_interface: String,
    /// Tenant-supplied contract config overrides applied at initiate.
    #[serde(default)]
    pub config: ConfigOverrides,
}

/// Tenant-supplied overrides merged into the instance's `hp.cfg` when
/// the container is initiated. Absent fields leave the template value
/// untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    /// `contract` section overrides.
    pub contract: ContractOverrides,
    /// `node` section overrides.
    pub node: NodeOverrides,
    /// `mesh` section overrides.
    pub mesh: MeshOverrides,
    /// `user` section overrides.
    pub user: UserOverrides,
    /// `hpfs` section overrides.
    pub hpfs: HpfsOverrides,
    /// `log` section overrides.
    pub log: LogOverrides,
}

/// Overrides for the `contract` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContractOverrides {
    /// Replacement unl (hex pubkeys).
    pub unl: Vec<String>,
    /// Whether the contract binary executes each round.
    pub execute: Option<bool>,
    /// Environment variables for the contract binary.
    pub environment: Option<Value>,
    /// Maximum input ledger offset.
    pub max_input_ledger_offset: Option<u64>,
    /// Consensus tuning.
    pub consensus: ConsensusOverrides,
    /// Npl message mode.
    pub npl: NplOverrides,
    /// Round limit tuning.
    pub round_limits: RoundLimitsOverrides,
    /// Contract log rotation tuning.
    pub log: FileLogOverrides,
}

/// Consensus overrides within the `contract` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsensusOverrides {
    /// `public` or `private`.
    pub mode: Option<String>,
    /// Round time in milliseconds.
    pub roundtime: Option<u64>,
    /// Stage slice percentage.
    pub stage_slice: Option<u64>,
    /// Voting threshold percentage.
    pub threshold: Option<u64>,
}

/// Npl overrides within the `contract` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NplOverrides {
    /// `public` or `private`.
    pub mode: Option<String>,
}

/// Round-limit overrides within the `contract` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoundLimitsOverrides {
    /// Max user input bytes per round.
    pub user_input_bytes: Option<u64>,
    /// Max user output bytes per round.
    pub user_output_bytes: Option<u64>,
    /// Max npl output bytes per round.
    pub npl_output_bytes: Option<u64>,
    /// Max contract cpu seconds per round.
    pub proc_cpu_seconds: Option<u64>,
    /// Max contract memory bytes.
    pub proc_mem_bytes: Option<u64>,
    /// Max open fd count.
    pub proc_ofd_count: Option<u64>,
    /// Contract execution timeout.
    pub exec_timeout: Option<u64>,
}

/// Log-rotation overrides shared by contract and top-level log sections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileLogOverrides {
    /// Max megabytes per log file.
    pub max_mbytes_per_file: Option<u64>,
    /// Max rotated file count.
    pub max_file_count: Option<u64>,
}

/// Overrides for the `node` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeOverrides {
    /// `observer` or `validator`.
    pub role: Option<String>,
    /// `full` or `custom`.
    pub history: Option<String>,
    /// History retention tuning.
    pub history_config: HistoryConfigOverrides,
}

/// History retention overrides within the `node` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HistoryConfigOverrides {
    /// Max primary shards retained.
    pub max_primary_shards: Option<u64>,
    /// Max raw shards retained.
    pub max_raw_shards: Option<u64>,
}

/// Overrides for the `mesh` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeshOverrides {
    /// Idle connection timeout.
    pub idle_timeout: Option<u64>,
    /// Known peer list as `host:port` strings.
    pub known_peers: Vec<String>,
    /// Whether peer message forwarding is enabled.
    pub msg_forwarding: Option<bool>,
    /// Max peer connections.
    pub max_connections: Option<u64>,
    /// Max known-peer connections.
    pub max_known_connections: Option<u64>,
    /// Max inbound connections per host.
    pub max_in_connections_per_host: Option<u64>,
    /// Max bytes per message.
    pub max_bytes_per_msg: Option<u64>,
    /// Max bytes per minute.
    pub max_bytes_per_min: Option<u64>,
    /// Max bad messages per minute.
    pub max_bad_msgs_per_min: Option<u64>,
    /// Max bad signatures per minute.
    pub max_bad_msgsigs_per_min: Option<u64>,
    /// Max duplicate messages per minute.
    pub max_dup_msgs_per_min: Option<u64>,
    /// Peer discovery tuning.
    pub peer_discovery: PeerDiscoveryOverrides,
}

/// Peer discovery overrides within the `mesh` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PeerDiscoveryOverrides {
    /// Whether discovery is enabled.
    pub enabled: Option<bool>,
    /// Discovery interval in milliseconds.
    pub interval: Option<u64>,
}

/// Overrides for the `user` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserOverrides {
    /// Idle connection timeout.
    pub idle_timeout: Option<u64>,
    /// Max bytes per message.
    pub max_bytes_per_msg: Option<u64>,
    /// Max bytes per minute.
    pub max_bytes_per_min: Option<u64>,
    /// Max bad messages per minute.
    pub max_bad_msgs_per_min: Option<u64>,
    /// Max user connections.
    pub max_connections: Option<u64>,
    /// Max inbound connections per host.
    pub max_in_connections_per_host: Option<u64>,
    /// Concurrent read request limit.
    pub concurrent_read_requests: Option<u64>,
}

/// Overrides for the `hpfs` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HpfsOverrides {
    /// hpfs log tuning.
    pub log: HpfsLogOverrides,
}

/// hpfs log overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HpfsLogOverrides {
    /// One of `dbg|inf|wrn|err`.
    pub log_level: Option<String>,
}

/// Overrides for the top-level `log` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogOverrides {
    /// Log level.
    pub log_level: Option<String>,
    /// Max megabytes per log file.
    pub max_mbytes_per_file: Option<u64>,
    /// Max rotated file count.
    pub max_file_count: Option<u64>,
    /// Logger sinks (`console`, `file`).
    pub loggers: Vec<String>,
}

/// Outbound daemon reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Reply type string, e.g. `create_res` or `create_error`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Result payload, or the error kind string for `*_error` replies.
    pub content: Value,
}

impl Response {
    /// Success reply carrying a JSON payload.
    #[must_use]
    pub fn ok(op: &str, content: Value) -> Self {
        Self {
            kind: format!("{op}_res"),
            content,
        }
    }

    /// Success reply carrying a plain status word (`destroyed` etc).
    #[must_use]
    pub fn ok_text(op: &str, text: &str) -> Self {
        Self {
            kind: format!("{op}_res"),
            content: Value::String(text.to_string()),
        }
    }

    /// Error reply carrying the machine-readable kind string.
    #[must_use]
    pub fn error(op: &str, reason: &str) -> Self {
        Self {
            kind: format!("{op}_error"),
            content: Value::String(reason.to_string()),
        }
    }

    /// Envelope-level error reply, used when no operation could be
    /// determined from the message.
    #[must_use]
    pub fn bare_error(reason: &str) -> Self {
        Self {
            kind: "error".to_string(),
            content: Value::String(reason.to_string()),
        }
    }

    /// The `initiate_error` reply: creation succeeded but config/start
    /// failed and the instance was rolled back.
    #[must_use]
    pub fn initiate_error(container_name: &str, reason: &str) -> Self {
        Self {
            kind: "initiate_error".to_string(),
            content: serde_json::json!({
                "container_name": container_name,
                "error": reason,
            }),
        }
    }

    /// `create_res` reply carrying the full instance info plus the OS
    /// user, which the reconciler records.
    #[must_use]
    pub fn create_res(instance: &Instance) -> Self {
        let mut content = serde_json::to_value(instance).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = content {
            map.insert("user".to_string(), Value::String(instance.username.clone()));
        }
        Self {
            kind: "create_res".to_string(),
            content,
        }
    }

    /// Whether this reply is an error of any kind.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.kind.ends_with("_error")
    }

    /// Serialize to the wire form.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error when the content cannot be
    /// serialized (practically unreachable for the payloads we build).
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_type_tag_routes() {
        let req: Request =
            serde_json::from_str(r#"{"type":"destroy","container_name":"web1"}"#).unwrap();
        assert!(matches!(req, Request::Destroy { container_name } if container_name == "web1"));

        let req: Request = serde_json::from_str(r#"{"type":"list"}"#).unwrap();
        assert!(matches!(req, Request::List));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let res: Result<Request, _> = serde_json::from_str(r#"{"type":"reboot"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn create_request_defaults_optional_fields() {
        let req: Request = serde_json::from_str(
            r#"{"type":"create","container_name":"c1","owner_pubkey":"ed1234",
                "contract_id":"00000000-0000-0000-0000-000000000000","image":"hp.latest-ubt.20.04"}"#,
        )
        .unwrap();
        let Request::Create(create) = req else {
            panic!("expected create");
        };
        assert!(create.outbound_ipv6.is_empty());
        assert!(create.config.contract.unl.is_empty());
        assert!(create.config.node.role.is_none());
    }

    #[test]
    fn error_reply_shape() {
        let res = Response::error("create", "max_alloc_reached");
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["type"], "create_error");
        assert_eq!(json["content"], "max_alloc_reached");
        assert!(res.is_error());
    }

    #[test]
    fn initiate_error_carries_container_name() {
        let res = Response::initiate_error("c1", "container_start_error");
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["type"], "initiate_error");
        assert_eq!(json["content"]["container_name"], "c1");
        assert_eq!(json["content"]["error"], "container_start_error");
    }
}
