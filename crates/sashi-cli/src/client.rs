//! Synchronous daemon socket client for the CLI.
//!
//! One request per invocation: connect, write the raw JSON request,
//! read one framed reply, print or return it.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sashi_core::framing::{HEADER_LEN, MAX_MESSAGE_SIZE};
use sashi_core::message::Response;
use serde_json::Value;

const SOCKET_NAME: &str = "sa.sock";
const DATA_DIR: &str = "/etc/sashimono";

/// Locate the daemon socket: next to the CLI binary for dev setups,
/// else in the data directory.
pub fn find_socket() -> Result<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(SOCKET_NAME);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    let candidate = Path::new(DATA_DIR).join(SOCKET_NAME);
    if candidate.exists() {
        return Ok(candidate);
    }
    bail!("{SOCKET_NAME} is not found");
}

/// Send one request and return the parsed reply.
pub fn exchange(socket_path: &Path, request: &Value) -> Result<Response> {
    let mut stream = UnixStream::connect(socket_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            anyhow::anyhow!(
                "permission denied: only root or users in the 'sashiadmin' group can access the sashimono socket"
            )
        } else {
            anyhow::anyhow!("cannot connect to the sashimono socket: {e}")
        }
    })?;

    let body = serde_json::to_vec(request)?;
    stream.write_all(&body).context("socket write failed")?;

    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).context("socket read failed")?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        bail!("daemon reply too large ({len} bytes)");
    }

    let mut reply = vec![0u8; len];
    stream.read_exact(&mut reply).context("socket read failed")?;
    serde_json::from_slice(&reply).context("daemon reply malformed")
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use sashi_core::framing::frame_message;
    use serde_json::json;

    use super::*;

    #[test]
    fn exchange_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).unwrap();
            let req: Value = serde_json::from_slice(&buf[..n]).unwrap();
            assert_eq!(req["type"], "list");
            let body =
                serde_json::to_vec(&json!({ "type": "list_res", "content": [] })).unwrap();
            stream.write_all(&frame_message(&body)).unwrap();
        });

        let reply = exchange(&path, &json!({ "type": "list" })).unwrap();
        assert_eq!(reply.kind, "list_res");
        server.join().unwrap();
    }
}
