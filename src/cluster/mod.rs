//! Raft consensus for index replication.
//!
//! Built on [openraft](https://docs.rs/openraft), this module provides:
//! - **types**: Raft type configuration and the replicated command envelope.
//! - **store**: persistent log store (sled) and the state machine that
//!   applies committed commands to the index adapter.
//! - **network**: HTTP-based RPC transport between Raft peers.
//! - **api**: Axum routes for the Raft protocol endpoints, served on the RPC
//!   address.

/// Axum routes for Raft protocol RPCs.
pub mod api;
/// HTTP-based Raft RPC network transport using reqwest.
pub mod network;
/// Persistent Raft log store and index state machine.
pub mod store;
/// Raft type configuration and the command envelope.
pub mod types;

pub use types::{Command, CommandResponse, NodeId, Raft, TypeConfig};
