//! Client for the lifecycle daemon's Unix socket.
//!
//! One request per connection: connect, send a raw JSON request, read
//! one framed reply (8-byte header, 4-byte big-endian length plus 4
//! reserved bytes), close. No connection reuse.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sashi_core::framing::{HEADER_LEN, MAX_MESSAGE_SIZE};
use sashi_core::message::Response;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by daemon requests.
#[derive(Debug, Error)]
pub enum DaemonClientError {
    /// The daemon socket does not exist or refused the connection.
    #[error("daemon is not running")]
    DaemonNotRunning,

    /// I/O failure during the exchange.
    #[error("daemon io: {0}")]
    Io(std::io::Error),

    /// The request did not complete within the timeout.
    #[error("daemon request timed out")]
    Timeout,

    /// The reply announced a body over the protocol cap.
    #[error("daemon reply of {size} bytes exceeds maximum {max}")]
    ReplyTooLarge {
        /// Announced size.
        size: usize,
        /// Protocol cap.
        max: usize,
    },

    /// The reply was not a valid envelope.
    #[error("daemon reply malformed: {0}")]
    Malformed(String),

    /// The daemon replied with an error kind.
    #[error("daemon error {kind}: {reason}")]
    Daemon {
        /// Reply type, e.g. `create_error` or `initiate_error`.
        kind: String,
        /// The machine-readable reason content.
        reason: String,
    },
}

impl From<std::io::Error> for DaemonClientError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                Self::DaemonNotRunning
            }
            _ => Self::Io(err),
        }
    }
}

/// Stateless daemon client; every call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    /// Client for the socket at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The socket path this client targets.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether the daemon socket exists.
    #[must_use]
    pub fn is_daemon_running(&self) -> bool {
        self.socket_path.exists()
    }

    /// List instances joined with lease fields.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or an error reply.
    pub async fn list(&self) -> Result<Vec<Value>, DaemonClientError> {
        let reply = self.request(&json!({ "type": "list" }), self.timeout).await?;
        match reply.content {
            Value::Array(rows) => Ok(rows),
            other => Err(DaemonClientError::Malformed(format!(
                "list_res content is not an array: {other}"
            ))),
        }
    }

    /// Probe whether the daemon is serving requests, bounded by
    /// `timeout`. Used to gate acquires on a busy daemon.
    ///
    /// # Errors
    ///
    /// `Timeout` when the daemon did not answer in time.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), DaemonClientError> {
        self.request(&json!({ "type": "list" }), timeout).await.map(|_| ())
    }

    /// Create and start an instance; returns the daemon's instance
    /// info.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, `create_error`, or `initiate_error`
    /// (the latter means the daemon already rolled the instance back).
    pub async fn create(&self, request: &Value) -> Result<Value, DaemonClientError> {
        let reply = self.request(request, self.timeout).await?;
        Ok(reply.content)
    }

    /// Destroy an instance.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or an error reply.
    pub async fn destroy(&self, container_name: &str) -> Result<(), DaemonClientError> {
        self.request(
            &json!({ "type": "destroy", "container_name": container_name }),
            self.timeout,
        )
        .await
        .map(|_| ())
    }

    async fn request(
        &self,
        request: &Value,
        timeout: Duration,
    ) -> Result<Response, DaemonClientError> {
        tokio::time::timeout(timeout, self.exchange(request))
            .await
            .map_err(|_| DaemonClientError::Timeout)?
    }

    async fn exchange(&self, request: &Value) -> Result<Response, DaemonClientError> {
        if !self.socket_path.exists() {
            return Err(DaemonClientError::DaemonNotRunning);
        }
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let body = serde_json::to_vec(request)
            .map_err(|e| DaemonClientError::Malformed(e.to_string()))?;
        stream.write_all(&body).await?;

        let mut header = [0u8; HEADER_LEN];
        stream.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(DaemonClientError::ReplyTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut reply = vec![0u8; len];
        stream.read_exact(&mut reply).await?;

        let response: Response = serde_json::from_slice(&reply)
            .map_err(|e| DaemonClientError::Malformed(e.to_string()))?;
        if response.is_error() || response.kind == "error" {
            return Err(DaemonClientError::Daemon {
                kind: response.kind,
                reason: response
                    .content
                    .get("error")
                    .and_then(Value::as_str)
                    .or_else(|| response.content.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(response)
    }
}
