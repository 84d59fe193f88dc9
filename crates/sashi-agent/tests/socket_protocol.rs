//! Socket protocol exercised over a real Unix socket: one raw JSON
//! request per connection, one framed reply, connection closed.

use std::path::Path;

use sashi_agent::context::AgentContext;
use sashi_agent::manager::InstanceManager;
use sashi_agent::server;
use sashi_core::config::{
    AgentConfig, DockerConfig, HpConfig, Ipv6Config, NetworkingConfig, SchedulerConfig,
    SystemConfig, XrplConfig,
};
use sashi_core::framing::HEADER_LEN;
use sashi_core::instance::{Instance, InstanceStatus, Ports};
use sashi_core::store::InstanceStore;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::watch;

fn test_config() -> AgentConfig {
    AgentConfig {
        version: "0.8.2".into(),
        xrpl: XrplConfig {
            address: "rHOST".into(),
            secret: "sSECRET".into(),
            governor_address: "rGOV".into(),
            network: None,
            rippled_server: None,
            fallback_rippled_servers: Vec::new(),
            lease_amount: 2.0,
            affordable_extra_fee: 0,
            reputation_address: None,
            reputation_secret: None,
        },
        networking: NetworkingConfig {
            ipv6: Ipv6Config {
                subnet: String::new(),
                interface: String::new(),
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
            init_peer_port: 22861,
            init_user_port: 26201,
            init_gp_tcp_port: 36525,
            init_gp_udp_port: 39064,
            host_address: "host.example.net".into(),
        },
        docker: DockerConfig {
            registry_address: "registry.example.net".into(),
            image_prefix: None,
        },
        scheduler: SchedulerConfig::default(),
    }
}

struct Server {
    socket_path: std::path::PathBuf,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<std::io::Result<()>>,
}

async fn start_server(dir: &Path) -> Server {
    let ctx = AgentContext::new(dir.to_path_buf(), dir.join("bin"));
    let manager = InstanceManager::init(ctx.clone(), test_config()).unwrap();
    let listener = server::bind_socket(&ctx.socket_path).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server::run(listener, manager, shutdown_rx));
    Server {
        socket_path: ctx.socket_path,
        shutdown: shutdown_tx,
        task,
    }
}

/// Send one raw request and read back the framed reply.
async fn roundtrip(socket_path: &Path, request: &[u8]) -> ([u8; HEADER_LEN], Value) {
    let mut stream = UnixStream::connect(socket_path).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    (header, serde_json::from_slice(&body).unwrap())
}

fn seeded_instance(name: &str, peer: u16, status: InstanceStatus) -> Instance {
    Instance {
        container_name: name.into(),
        owner_pubkey: "edOWNER".into(),
        contract_id: "7c7e9f51-70fa-4d00-9c6d-51a1f1bd7d2b".into(),
        contract_dir: format!("/home/sashi{peer}/{name}/contract"),
        image_name: "hp.latest-ubt.20.04".into(),
        assigned_ports: Ports {
            peer_port: peer,
            user_port: peer + 3340,
            gp_tcp_port_start: peer + 13664,
            gp_udp_port_start: peer + 16203,
        },
        status,
        pubkey: "ed11".into(),
        ip: "host.example.net".into(),
        username: format!("sashi{peer}"),
    }
}

#[tokio::test]
async fn reply_header_carries_length_and_reserved_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (header, reply) = roundtrip(&server.socket_path, br#"{"type":"list"}"#).await;
    assert_eq!(&header[4..], &[0, 0, 0, 0], "reserved bytes must be zero");
    assert_eq!(reply["type"], "list_res");
    assert_eq!(reply["content"], serde_json::json!([]));

    let _ = server.shutdown.send(true);
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_and_unknown_requests_get_error_replies() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (_, reply) = roundtrip(&server.socket_path, b"this is not json").await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["content"], "format_error");

    let (_, reply) = roundtrip(&server.socket_path, br#"{"type":"selfdestruct"}"#).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["content"], "type_error");

    let (_, reply) = roundtrip(&server.socket_path, br#"{"type":"start"}"#).await;
    assert_eq!(reply["type"], "start_error");
    assert_eq!(reply["content"], "format_error");

    let _ = server.shutdown.send(true);
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn sequential_connections_each_get_one_reply() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    for _ in 0..5 {
        let (_, reply) = roundtrip(&server.socket_path, br#"{"type":"list"}"#).await;
        assert_eq!(reply["type"], "list_res");
    }

    let _ = server.shutdown.send(true);
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn inspect_returns_row_with_user_field() {
    let dir = tempfile::tempdir().unwrap();

    // Seed an instance row before the server opens the store.
    let store = InstanceStore::new(dir.path().join("sa.sqlite"));
    store.ensure_schema().unwrap();
    store
        .insert(&seeded_instance("web1", 22861, InstanceStatus::Running))
        .unwrap();

    let server = start_server(dir.path()).await;

    let (_, reply) = roundtrip(
        &server.socket_path,
        br#"{"type":"inspect","container_name":"web1"}"#,
    )
    .await;
    assert_eq!(reply["type"], "inspect_res");
    assert_eq!(reply["content"]["container_name"], "web1");
    assert_eq!(reply["content"]["user"], "sashi22861");
    assert_eq!(reply["content"]["assigned_ports"]["peer_port"], 22861);

    let (_, reply) = roundtrip(
        &server.socket_path,
        br#"{"type":"inspect","container_name":"nope"}"#,
    )
    .await;
    assert_eq!(reply["type"], "inspect_error");
    assert_eq!(reply["content"], "container_not_found");

    let _ = server.shutdown.send(true);
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn state_gates_are_enforced_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let store = InstanceStore::new(dir.path().join("sa.sqlite"));
    store.ensure_schema().unwrap();
    store
        .insert(&seeded_instance("web1", 22861, InstanceStatus::Created))
        .unwrap();

    let server = start_server(dir.path()).await;

    // start requires stopped; the row is created.
    let (_, reply) = roundtrip(
        &server.socket_path,
        br#"{"type":"start","container_name":"web1"}"#,
    )
    .await;
    assert_eq!(reply["type"], "start_error");
    assert_eq!(reply["content"], "dup_container");

    // stop requires running.
    let (_, reply) = roundtrip(
        &server.socket_path,
        br#"{"type":"stop","container_name":"web1"}"#,
    )
    .await;
    assert_eq!(reply["type"], "stop_error");
    assert_eq!(reply["content"], "dup_container");

    let _ = server.shutdown.send(true);
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn create_error_reports_machine_readable_kind() {
    let dir = tempfile::tempdir().unwrap();
    let server = start_server(dir.path()).await;

    let (_, reply) = roundtrip(
        &server.socket_path,
        br#"{"type":"create","container_name":"c1","owner_pubkey":"ed1",
             "contract_id":"not-a-uuid","image":"hp.latest"}"#,
    )
    .await;
    assert_eq!(reply["type"], "create_error");
    assert_eq!(reply["content"], "contractid_bad_format");

    let _ = server.shutdown.send(true);
    server.task.await.unwrap().unwrap();
}
