//! # sashi-board
//!
//! The message-board reconciliation service. Connects to the ledger,
//! listens for lease events, drives the lifecycle daemon over its
//! socket, and keeps durable lease records.
//!
//! The service is single-threaded cooperative: one task owns the
//! reconciler and multiplexes the ledger event stream, the scheduler
//! tick, the heartbeat timer, and the orphan-prune timer. Every failure
//! path converges on a refunded tenant and a re-offerable lease slot.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod daemon_client;
pub mod expiry;
pub mod halt;
pub mod heartbeat;
pub mod ledger;
pub mod locks;
pub mod reconciler;
pub mod txqueue;

pub use reconciler::Reconciler;
