//! # sashi-core
//!
//! Shared building blocks for the sashimono host agent: the typed agent
//! configuration, the instance/lease data model, the Unix-socket message
//! envelope, and the length-prefixed frame codec both services speak.
//!
//! The lifecycle daemon (`sashi-agent`), the message-board reconciler
//! (`sashi-board`), and the CLI (`sashi-cli`) all build on this crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod framing;
pub mod instance;
pub mod lease;
pub mod message;
pub mod store;

pub use config::{AgentConfig, GovernanceFile, Vote};
pub use error::AgentError;
pub use framing::FrameCodec;
pub use instance::{Instance, InstanceStatus, Ports, Resources};
pub use lease::{Lease, LeaseStatus};
pub use message::{Request, Response};
pub use store::{InstanceStore, LeaseStore};
