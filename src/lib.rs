//! annex — replicated nearest-neighbor index server.
//!
//! Write operations travel through a Raft log so every node applies them in
//! the same order against its local index; searches are served from the
//! local replica. The ANN index itself is the external `instant-distance`
//! library, owned through the adapter in [`index`].

/// REST API layer: Axum router, HTTP handlers, models, metrics.
pub mod api;
/// Raft consensus: command codec, log/state-machine stores, RPC transport.
pub mod cluster;
/// Configuration constants.
pub mod config;
/// Thread-exclusive adapter around the external ANN index library.
pub mod index;
/// Node assembly: Raft runtime construction, bootstrap, and cluster join.
pub mod node;
