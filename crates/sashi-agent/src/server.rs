//! The daemon socket: bootstrap, accept loop, and request dispatch.
//!
//! Exactly one client is served at a time. The handler reads one raw
//! JSON request in a single receive, replies with one framed message,
//! and closes the connection. Serving connections sequentially is what
//! serializes every instance mutation.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::unistd::Group;
use sashi_core::error::AgentError;
use sashi_core::framing::{frame_message, MAX_MESSAGE_SIZE};
use sashi_core::message::{Request, Response};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::manager::InstanceManager;

/// Group that may talk to the daemon socket.
const SOCKET_GROUP: &str = "sashiadmin";

/// Bind the daemon socket, replacing any stale file, and restrict it to
/// the admin group (mode 0660).
///
/// # Errors
///
/// Fails when the socket cannot be bound or its permissions applied.
pub fn bind_socket(socket_path: &Path) -> std::io::Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))?;

    match Group::from_name(SOCKET_GROUP) {
        Ok(Some(group)) => {
            nix::unistd::chown(socket_path, None, Some(group.gid))
                .map_err(std::io::Error::other)?;
        }
        _ => {
            // Dev hosts have no admin group; the socket stays owned by
            // the invoking user.
            warn!("group {SOCKET_GROUP} not found, socket group unchanged");
        }
    }

    info!(socket = %socket_path.display(), "daemon socket ready");
    Ok(listener)
}

/// Serve the socket until shutdown is signalled.
///
/// # Errors
///
/// Fails only on accept errors the listener cannot recover from.
pub async fn run(
    listener: UnixListener,
    mut manager: InstanceManager,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!("message processor started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                if let Err(e) = serve_connection(stream, &mut manager).await {
                    warn!("connection handling failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("message processor stopped");
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    manager: &mut InstanceManager,
) -> std::io::Result<()> {
    // One message per connection; a local client sends it in one write.
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let response = dispatch(manager, &buf[..n]).await;
    let body = response.to_bytes().map_err(std::io::Error::other)?;
    stream.write_all(&frame_message(&body)).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Route one raw request to the manager and build the reply.
pub async fn dispatch(manager: &mut InstanceManager, raw: &[u8]) -> Response {
    let Ok(doc) = serde_json::from_slice::<Value>(raw) else {
        return Response::bare_error(AgentError::Format.kind());
    };
    if doc.get("type").and_then(Value::as_str).is_none() {
        return Response::bare_error(AgentError::Format.kind());
    }

    let request: Request = match serde_json::from_value(doc.clone()) {
        Ok(request) => request,
        Err(_) => {
            // A known type with bad fields is a format error on that
            // operation; an unknown type is a type error.
            return match doc["type"].as_str() {
                Some(op @ ("list" | "create" | "destroy" | "start" | "stop" | "inspect")) => {
                    Response::error(op, AgentError::Format.kind())
                }
                _ => Response::bare_error(AgentError::UnknownType(String::new()).kind()),
            };
        }
    };

    match request {
        Request::List => match manager.list() {
            Ok(rows) => Response::ok("list", Value::Array(rows)),
            Err(e) => Response::error("list", e.kind()),
        },
        Request::Create(req) => match manager.create(&req).await {
            Err(e) => Response::error("create", e.kind()),
            Ok(instance) => match manager.initiate(&req.container_name, &req.config).await {
                Ok(()) => Response::create_res(&instance),
                Err(e) => {
                    // The partially created instance is rolled back;
                    // the caller treats it as already destroyed.
                    if let Err(destroy_err) = manager.destroy(&req.container_name).await {
                        warn!(
                            container_name = %req.container_name,
                            "rollback destroy failed: {destroy_err}"
                        );
                    }
                    Response::initiate_error(&req.container_name, e.kind())
                }
            },
        },
        Request::Destroy { container_name } => match manager.destroy(&container_name).await {
            Ok(()) => Response::ok_text("destroy", "destroyed"),
            Err(e) => Response::error("destroy", e.kind()),
        },
        Request::Start { container_name } => match manager.start(&container_name).await {
            Ok(()) => Response::ok_text("start", "started"),
            Err(e) => Response::error("start", e.kind()),
        },
        Request::Stop { container_name } => match manager.stop(&container_name).await {
            Ok(()) => Response::ok_text("stop", "stopped"),
            Err(e) => Response::error("stop", e.kind()),
        },
        Request::Inspect { container_name } => match manager.inspect(&container_name) {
            Ok(instance) => {
                let mut content = serde_json::to_value(&instance).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut content {
                    map.insert("user".into(), Value::from(instance.username.clone()));
                }
                Response::ok("inspect", content)
            }
            Err(e) => Response::error("inspect", e.kind()),
        },
    }
}

#[cfg(test)]
mod tests {
    use sashi_core::config::{
        AgentConfig, DockerConfig, HpConfig, Ipv6Config, NetworkingConfig, SchedulerConfig,
        SystemConfig, XrplConfig,
    };

    use super::*;
    use crate::context::AgentContext;

    fn test_manager(dir: &Path) -> InstanceManager {
        let cfg = AgentConfig {
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
        };
        let ctx = AgentContext::new(dir.to_path_buf(), dir.join("bin"));
        InstanceManager::init(ctx, cfg).unwrap()
    }

    #[tokio::test]
    async fn malformed_json_yields_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = test_manager(dir.path());
        let res = dispatch(&mut mgr, b"{ nope").await;
        assert_eq!(res.kind, "error");
        assert_eq!(res.content, "format_error");
    }

    #[tokio::test]
    async fn unknown_type_yields_type_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = test_manager(dir.path());
        let res = dispatch(&mut mgr, br#"{"type":"reboot"}"#).await;
        assert_eq!(res.kind, "error");
        assert_eq!(res.content, "type_error");
    }

    #[tokio::test]
    async fn known_type_with_bad_fields_is_op_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = test_manager(dir.path());
        let res = dispatch(&mut mgr, br#"{"type":"destroy"}"#).await;
        assert_eq!(res.kind, "destroy_error");
        assert_eq!(res.content, "format_error");
    }

    #[tokio::test]
    async fn list_on_empty_store_is_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = test_manager(dir.path());
        let res = dispatch(&mut mgr, br#"{"type":"list"}"#).await;
        assert_eq!(res.kind, "list_res");
        assert_eq!(res.content, serde_json::json!([]));
    }

    #[tokio::test]
    async fn inspect_missing_instance_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = test_manager(dir.path());
        let res = dispatch(&mut mgr, br#"{"type":"inspect","container_name":"zz"}"#).await;
        assert_eq!(res.kind, "inspect_error");
        assert_eq!(res.content, "container_not_found");
    }

    #[tokio::test]
    async fn create_with_bad_contract_id_reports_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = test_manager(dir.path());
        let res = dispatch(
            &mut mgr,
            br#"{"type":"create","container_name":"c1","owner_pubkey":"ed1",
                 "contract_id":"nope","image":"hp.latest"}"#,
        )
        .await;
        assert_eq!(res.kind, "create_error");
        assert_eq!(res.content, "contractid_bad_format");
    }
}
