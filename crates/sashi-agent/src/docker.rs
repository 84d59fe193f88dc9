//! Docker CLI delegation.
//!
//! Every container operation runs the bundled docker binary against the
//! rootless docker daemon of the instance's OS user, selected via
//! `DOCKER_HOST=unix:///run/user/<uid>/docker.sock`.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::unistd::User;
use sashi_core::instance::Ports;
use tokio::process::Command;
use tracing::{info, warn};

/// Hard ceiling on `docker create`; image pulls can stall indefinitely
/// otherwise.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs the bundled docker CLI as instance users.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker_bin: PathBuf,
}

impl DockerRunner {
    /// Runner using the docker binary under `docker_bin_dir`.
    #[must_use]
    pub fn new(docker_bin_dir: &std::path::Path) -> Self {
        Self {
            docker_bin: docker_bin_dir.join("docker"),
        }
    }

    /// The `DOCKER_HOST` value for `username`'s rootless daemon.
    fn docker_host(username: &str) -> std::io::Result<String> {
        let user = User::from_name(username)
            .map_err(std::io::Error::other)?
            .ok_or_else(|| std::io::Error::other(format!("no such user {username}")))?;
        Ok(format!("unix:///run/user/{}/docker.sock", user.uid))
    }

    async fn run(
        &self,
        username: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> std::io::Result<std::process::Output> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.env("DOCKER_HOST", Self::docker_host(username)?)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let fut = cmd.output();
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                warn!(?args, "docker command timed out");
                std::io::Error::new(std::io::ErrorKind::TimedOut, "docker command timed out")
            })??,
            None => fut.await?,
        };

        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "docker {} exited with {}: {}",
                args.first().map_or("", String::as_str),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        Ok(output)
    }

    /// `docker create` with the instance's port publishes and contract
    /// bind mount. Bounded by [`CREATE_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Fails on spawn errors, nonzero exit, or timeout.
    pub async fn create(
        &self,
        username: &str,
        image_name: &str,
        container_name: &str,
        contract_dir: &str,
        ports: Ports,
    ) -> std::io::Result<()> {
        info!(container_name, image_name, "creating container");
        let args = create_args(image_name, container_name, contract_dir, ports);
        self.run(username, &args, Some(CREATE_TIMEOUT)).await?;
        Ok(())
    }

    /// `docker start`.
    ///
    /// # Errors
    ///
    /// Fails on spawn errors or nonzero exit.
    pub async fn start(&self, username: &str, container_name: &str) -> std::io::Result<()> {
        self.run(username, &["start".into(), container_name.into()], None)
            .await?;
        Ok(())
    }

    /// `docker stop`.
    ///
    /// # Errors
    ///
    /// Fails on spawn errors or nonzero exit.
    pub async fn stop(&self, username: &str, container_name: &str) -> std::io::Result<()> {
        self.run(username, &["stop".into(), container_name.into()], None)
            .await?;
        Ok(())
    }

    /// `docker rm -f`.
    ///
    /// # Errors
    ///
    /// Fails on spawn errors or nonzero exit.
    pub async fn remove(&self, username: &str, container_name: &str) -> std::io::Result<()> {
        self.run(
            username,
            &["rm".into(), "-f".into(), container_name.into()],
            None,
        )
        .await?;
        Ok(())
    }

    /// Runtime status of the container (`running`, `exited`, ...).
    ///
    /// # Errors
    ///
    /// Fails on spawn errors or nonzero exit.
    pub async fn status(&self, username: &str, container_name: &str) -> std::io::Result<String> {
        let output = self
            .run(
                username,
                &[
                    "inspect".into(),
                    "--format={{json .State.Status}}".into(),
                    container_name.into(),
                ],
                None,
            )
            .await?;
        Ok(parse_status(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Argument vector for `docker create`.
///
/// The container restarts automatically unless manually stopped, stops
/// on SIGINT, and keeps two 5 MiB local log files for failure
/// debugging; everything else logs to files inside the contract.
fn create_args(
    image_name: &str,
    container_name: &str,
    contract_dir: &str,
    ports: Ports,
) -> Vec<String> {
    let peer = ports.peer_port;
    let user = ports.user_port;
    let gp_tcp = ports.gp_tcp_port_start;
    let gp_udp = ports.gp_udp_port_start;
    vec![
        "create".into(),
        "-t".into(),
        "-i".into(),
        "--stop-signal=SIGINT".into(),
        "--log-driver".into(),
        "local".into(),
        "--log-opt".into(),
        "max-size=5m".into(),
        "--log-opt".into(),
        "max-file=2".into(),
        format!("--name={container_name}"),
        "-p".into(),
        format!("{user}:{user}"),
        "-p".into(),
        format!("{peer}:{peer}"),
        "-p".into(),
        format!("{peer}:{peer}/udp"),
        "-p".into(),
        format!("{gp_tcp}:{gp_tcp}"),
        "-p".into(),
        format!("{0}:{0}", gp_tcp + 1),
        "-p".into(),
        format!("{gp_udp}:{gp_udp}/udp"),
        "-p".into(),
        format!("{0}:{0}/udp", gp_udp + 1),
        "--restart".into(),
        "unless-stopped".into(),
        "--mount".into(),
        format!("type=bind,source={contract_dir},target=/contract"),
        image_name.into(),
        "run".into(),
        "/contract".into(),
    ]
}

/// `docker inspect --format={{json .State.Status}}` prints a quoted
/// JSON string; strip the quotes.
fn parse_status(raw: &str) -> String {
    raw.trim().trim_matches('"').to_string()
}
