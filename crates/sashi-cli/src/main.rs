//! sashi - CLI wrapper over the sashimono daemon socket.

mod client;

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::unistd::User;
use serde_json::{json, Value};

/// sashimono instance management CLI
#[derive(Parser, Debug)]
#[command(name = "sashi")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List instances with their lease details
    List,
    /// Create and start a new instance
    Create {
        /// Container name
        container_name: String,
        /// Owner public key
        owner_pubkey: String,
        /// Contract id (uuid)
        contract_id: String,
        /// Docker image
        image: String,
        /// Outbound IPv6 address
        #[arg(default_value = "")]
        outbound_ipv6: String,
        /// Outbound network interface
        #[arg(default_value = "")]
        outbound_net_interface: String,
    },
    /// Start a stopped instance
    Start {
        /// Container name
        container_name: String,
    },
    /// Stop a running instance
    Stop {
        /// Container name
        container_name: String,
    },
    /// Destroy an instance
    Destroy {
        /// Container name
        container_name: String,
    },
    /// Show one instance
    Inspect {
        /// Container name
        container_name: String,
    },
    /// Attach to an instance's container (ctrl-c detaches)
    Attach {
        /// Container name
        container_name: String,
    },
}

/// Columns shown by `sashi list`.
const LIST_COLUMNS: &[(&str, &str)] = &[
    ("container_name", "NAME"),
    ("status", "STATUS"),
    ("tenant_address", "TENANT"),
    ("life_moments", "MOMENTS"),
    ("username", "USER"),
    ("ip", "IP"),
];

fn main() {
    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = client::find_socket()?;

    match cli.command {
        Commands::List => {
            let reply = client::exchange(&socket_path, &json!({ "type": "list" }))?;
            if reply.kind != "list_res" {
                bail!("unexpected reply: {}", serde_json::to_string(&reply)?);
            }
            let Value::Array(rows) = &reply.content else {
                bail!("invalid list response");
            };
            print_table(rows);
        }
        Commands::Create {
            container_name,
            owner_pubkey,
            contract_id,
            image,
            outbound_ipv6,
            outbound_net_interface,
        } => {
            let request = json!({
                "type": "create",
                "container_name": container_name,
                "owner_pubkey": owner_pubkey,
                "contract_id": contract_id,
                "image": image,
                "outbound_ipv6": outbound_ipv6,
                "outbound_net_interface": outbound_net_interface,
                "config": {},
            });
            let reply = client::exchange(&socket_path, &request)?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            if reply.is_error() {
                std::process::exit(1);
            }
        }
        Commands::Start { container_name } => basic(&socket_path, "start", &container_name)?,
        Commands::Stop { container_name } => basic(&socket_path, "stop", &container_name)?,
        Commands::Destroy { container_name } => basic(&socket_path, "destroy", &container_name)?,
        Commands::Inspect { container_name } => {
            let reply = inspect(&socket_path, &container_name)?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
        }
        Commands::Attach { container_name } => {
            let content = inspect(&socket_path, &container_name)?;
            let username = content
                .get("user")
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty())
                .context("invalid user in inspect response")?;
            attach(username, &container_name)?;
        }
    }
    Ok(())
}

fn basic(socket_path: &std::path::Path, op: &str, container_name: &str) -> Result<()> {
    let reply = client::exchange(
        socket_path,
        &json!({ "type": op, "container_name": container_name }),
    )?;
    println!("{}", serde_json::to_string(&reply)?);
    if reply.is_error() {
        std::process::exit(1);
    }
    Ok(())
}

fn inspect(socket_path: &std::path::Path, container_name: &str) -> Result<Value> {
    let reply = client::exchange(
        socket_path,
        &json!({ "type": "inspect", "container_name": container_name }),
    )?;
    if reply.kind != "inspect_res" {
        bail!("{}", serde_json::to_string(&reply)?);
    }
    Ok(reply.content)
}

/// Exec `docker attach` against the instance user's rootless daemon,
/// with ctrl-c bound as the detach key.
fn attach(username: &str, container_name: &str) -> Result<()> {
    let user = User::from_name(username)
        .ok()
        .flatten()
        .with_context(|| format!("no such user {username}"))?;
    let docker = docker_bin()?;

    println!("ctrl+c to detach.");
    let status = Command::new(docker)
        .env(
            "DOCKER_HOST",
            format!("unix:///run/user/{}/docker.sock", user.uid),
        )
        .args(["attach", "--detach-keys=ctrl-c", container_name])
        .status()
        .context("failed to run docker attach")?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

/// Locate the bundled docker binary: next to the CLI for dev setups,
/// else the production binary directory.
fn docker_bin() -> Result<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("dockerbin").join("docker");
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    let candidate = PathBuf::from("/usr/bin/sashimono/dockerbin/docker");
    if candidate.exists() {
        return Ok(candidate);
    }
    bail!("docker binary is not found");
}

/// Render list rows as a padded table.
fn print_table(rows: &[Value]) {
    let mut widths: Vec<usize> = LIST_COLUMNS.iter().map(|(_, h)| h.len()).collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            LIST_COLUMNS
                .iter()
                .enumerate()
                .map(|(i, (key, _))| {
                    let text = match row.get(*key) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Number(n)) => n.to_string(),
                        _ => String::new(),
                    };
                    widths[i] = widths[i].max(text.len());
                    text
                })
                .collect()
        })
        .collect();

    for (i, (_, header)) in LIST_COLUMNS.iter().enumerate() {
        print!("{header:<width$}  ", width = widths[i]);
    }
    println!();
    for (i, _) in LIST_COLUMNS.iter().enumerate() {
        print!("{:-<width$}  ", "", width = widths[i]);
    }
    println!();
    for row in cells {
        for (i, cell) in row.iter().enumerate() {
            print!("{cell:<width$}  ", width = widths[i]);
        }
        println!();
    }
}
