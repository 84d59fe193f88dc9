//! # sashi-agent
//!
//! The instance lifecycle daemon. Owns the instance store and the
//! `sa.sock` Unix socket, and translates socket requests into container,
//! OS-user, and filesystem-service mutations on this host.
//!
//! Container operations are delegated to the docker CLI run as the
//! per-instance user; user and cgroup provisioning are delegated to the
//! install/uninstall shell scripts. The daemon itself only sequences
//! those collaborators and keeps the instance store truthful.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod contract;
pub mod docker;
pub mod hpfs;
pub mod manager;
pub mod ports;
pub mod preflight;
pub mod server;
pub mod shell;
pub mod users;

pub use context::AgentContext;
pub use manager::InstanceManager;
