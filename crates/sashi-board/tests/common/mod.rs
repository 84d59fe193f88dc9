//! Shared fixtures: a scripted stand-in for the lifecycle daemon and a
//! reconciler harness wired to the mock ledger.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sashi_board::daemon_client::DaemonClient;
use sashi_board::ledger::mock::MockLedger;
use sashi_board::ledger::uri::{self, LeaseUri};
use sashi_board::ledger::{AcquireEvent, AcquirePayload, LedgerClient, UriToken};
use sashi_board::reconciler::{Reconciler, ReconcilerDeps};
use sashi_core::config::{
    AgentConfig, DockerConfig, HpConfig, Ipv6Config, NetworkingConfig, SchedulerConfig,
    SystemConfig, XrplConfig,
};
use sashi_core::framing::{frame_message, MAX_MESSAGE_SIZE};
use sashi_core::instance::Ports;
use sashi_core::store::{InstanceStore, LeaseStore};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;

pub const HOST: &str = "rHOST";
pub const TENANT: &str = "rTENANT";
pub const TOKEN_T1: &str = "T1";

pub const INIT_PORTS: Ports = Ports {
    peer_port: 22861,
    user_port: 26201,
    gp_tcp_port_start: 36525,
    gp_udp_port_start: 39064,
};

/// Scripted daemon behavior.
#[derive(Debug, Default)]
pub struct StubState {
    pub instances: Vec<Value>,
    pub vacant: Vec<Ports>,
    pub created_count: u16,
    pub destroyed: Vec<String>,
    /// Sleep before serving any request; simulates a busy daemon.
    pub delay: Option<Duration>,
    /// Reply to the next create with this error kind.
    pub fail_create: Option<String>,
}

pub struct StubDaemon {
    pub socket_path: PathBuf,
    pub state: Arc<Mutex<StubState>>,
}

impl StubDaemon {
    pub async fn spawn(dir: &Path) -> Self {
        let socket_path = dir.join("sa.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();
        let state = Arc::new(Mutex::new(StubState::default()));

        let task_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let delay = task_state.lock().unwrap().delay;
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
                let Ok(n) = stream.read(&mut buf).await else {
                    continue;
                };
                if n == 0 {
                    continue;
                }
                let Ok(request) = serde_json::from_slice::<Value>(&buf[..n]) else {
                    continue;
                };

                let reply = handle(&task_state, &request);
                let body = serde_json::to_vec(&reply).unwrap();
                let _ = stream.write_all(&frame_message(&body)).await;
            }
        });

        Self { socket_path, state }
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().delay = delay;
    }

    pub fn instance(&self, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|i| i["container_name"] == name)
            .cloned()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().unwrap().destroyed.clone()
    }
}

fn handle(state: &Arc<Mutex<StubState>>, request: &Value) -> Value {
    let mut state = state.lock().unwrap();
    match request["type"].as_str() {
        Some("list") => json!({
            "type": "list_res",
            "content": state.instances.clone(),
        }),
        Some("create") => {
            if let Some(kind) = state.fail_create.take() {
                return json!({ "type": "create_error", "content": kind });
            }
            let name = request["container_name"].as_str().unwrap_or_default().to_string();
            let ports = state.vacant.pop().unwrap_or_else(|| {
                let mut ports = INIT_PORTS;
                for _ in 0..state.created_count {
                    ports = ports.next();
                }
                ports
            });
            state.created_count += 1;
            let instance = json!({
                "container_name": name,
                "owner_pubkey": request["owner_pubkey"],
                "contract_id": request["contract_id"],
                "contract_dir": format!("/home/sashi1/{name}/contract"),
                "image_name": request["image"],
                "assigned_ports": {
                    "peer_port": ports.peer_port,
                    "user_port": ports.user_port,
                    "gp_tcp_port_start": ports.gp_tcp_port_start,
                    "gp_udp_port_start": ports.gp_udp_port_start,
                },
                "status": "running",
                "pubkey": "ed11",
                "ip": "host.example.net",
                "username": "sashi1",
                "user": "sashi1",
            });
            state.instances.push(instance.clone());
            json!({ "type": "create_res", "content": instance })
        }
        Some("destroy") => {
            let name = request["container_name"].as_str().unwrap_or_default().to_string();
            let before = state.instances.len();
            let mut freed = None;
            state.instances.retain(|i| {
                if i["container_name"] == name.as_str() {
                    freed = serde_json::from_value::<Ports>(i["assigned_ports"].clone()).ok();
                    false
                } else {
                    true
                }
            });
            if state.instances.len() == before {
                return json!({ "type": "destroy_error", "content": "no_container" });
            }
            if let Some(ports) = freed {
                state.vacant.push(ports);
            }
            state.destroyed.push(name);
            json!({ "type": "destroy_res", "content": "destroyed" })
        }
        _ => json!({ "type": "error", "content": "type_error" }),
    }
}

pub fn test_config(_dir: &Path) -> AgentConfig {
    AgentConfig {
        version: "0.8.2".into(),
        xrpl: XrplConfig {
            address: HOST.into(),
            secret: "sSECRET".into(),
            governor_address: "rGOV".into(),
            network: None,
            rippled_server: None,
            fallback_rippled_servers: Vec::new(),
            lease_amount: 2.0,
            affordable_extra_fee: 90,
            reputation_address: None,
            reputation_secret: None,
        },
        networking: NetworkingConfig {
            ipv6: Ipv6Config {
                subnet: String::new(),
                interface: "eth0".into(),
            },
        },
        system: SystemConfig {
            max_instance_count: 3,
            max_cpu_us: 900_000,
            max_mem_kbytes: 3_145_728,
            max_swap_kbytes: 3_145_728,
            max_storage_kbytes: 9_437_184,
        },
        hp: HpConfig {
            init_peer_port: INIT_PORTS.peer_port,
            init_user_port: INIT_PORTS.user_port,
            init_gp_tcp_port: INIT_PORTS.gp_tcp_port_start,
            init_gp_udp_port: INIT_PORTS.gp_udp_port_start,
            host_address: "host.example.net".into(),
        },
        docker: DockerConfig {
            registry_address: "registry.example.net".into(),
            image_prefix: None,
        },
        scheduler: SchedulerConfig::default(),
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub mock: Arc<MockLedger>,
    pub stub: StubDaemon,
    pub store: LeaseStore,
    pub reconciler: Reconciler,
}

impl Harness {
    /// Harness with the default one-hour moment and a short acquire
    /// window so timeout paths stay fast in tests.
    pub async fn new() -> Self {
        Self::with_tuning(5, 0.25).await
    }

    pub async fn with_tuning(acquire_window: u64, halt_threshold: f64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLedger::new());
        mock.set_hook_config(sashi_board::ledger::HookConfig {
            moment_size: 3600,
            lease_acquire_window: acquire_window,
            purchaser_target_price: 2.0,
            tos_hash: "TOS".into(),
        });

        let stub = StubDaemon::spawn(dir.path()).await;
        let store = LeaseStore::new(dir.path().join("mb-xahau.sqlite"));
        store.ensure_schema().unwrap();
        let instance_store = InstanceStore::new(dir.path().join("sa.sqlite"));
        instance_store.ensure_schema().unwrap();

        let mut config = test_config(dir.path());
        config.scheduler.halt_threshold = halt_threshold;
        let config_path = dir.path().join("sa.cfg");
        config.save(&config_path).unwrap();

        let registration = mock.host_registration().await.unwrap();
        let hook = mock.hook_config().await.unwrap();

        let reconciler = Reconciler::new(ReconcilerDeps {
            config,
            config_path,
            governance_path: dir.path().join("governance.cfg"),
            client: Arc::clone(&mock) as Arc<dyn LedgerClient>,
            daemon: DaemonClient::new(&stub.socket_path),
            store: store.clone(),
            instance_store,
            registration,
            hook,
        });

        Self {
            dir,
            mock,
            stub,
            store,
            reconciler,
        }
    }

    /// Stage the T1 lease token on the mock, owned by `owner`.
    pub fn stage_token(&self, owner: &str, lease_index: u32, amount: f64) {
        self.mock.put_token(UriToken {
            token_id: TOKEN_T1.into(),
            owner: owner.into(),
            uri: uri::encode(&LeaseUri {
                lease_index,
                lease_amount: amount,
                outbound_ip: None,
            }),
            has_sell_offer: false,
        });
    }

    pub fn acquire_event(&self, amount: f64) -> AcquireEvent {
        AcquireEvent {
            tenant: TENANT.into(),
            host: HOST.into(),
            tx_hash: "ACQ1".into(),
            token_id: TOKEN_T1.into(),
            amount,
            ledger_index: 82_000_001,
            payload: AcquirePayload {
                owner_pubkey: "edOWNER".into(),
                contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".into(),
                image: "hp.latest-ubt.20.04".into(),
                config: json!({}),
            },
        }
    }
}
