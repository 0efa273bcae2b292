//! Server configuration constants.
//!
//! Compile-time defaults; runtime configuration is handled via CLI arguments
//! in `main.rs`.

/// Default HTTP (client API) bind address.
pub const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8000";

/// Default Raft RPC bind address.
pub const DEFAULT_RPC_ADDR: &str = "0.0.0.0:8001";

/// Upper bound on a `Raft::client_write` call, in milliseconds. A write that
/// exceeds this is reported as failed to the client but may still commit.
pub const APPLY_TIMEOUT_MS: u64 = 1_000;

/// Raft heartbeat interval in milliseconds.
pub const HEARTBEAT_INTERVAL_MS: u64 = 500;

/// Raft election timeout bounds in milliseconds.
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 1_500;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 3_000;

/// A snapshot is taken once this many log entries accumulate past the last
/// snapshot.
pub const SNAPSHOT_THRESHOLD: u64 = 2;

/// Interval of the background snapshot trigger, in seconds.
pub const SNAPSHOT_INTERVAL_SECS: u64 = 20;

/// Number of snapshots retained on disk.
pub const SNAPSHOT_RETAIN: usize = 3;

/// Raw bytes per snapshot chunk sent between peers. Must stay well under the
/// RPC body limit after JSON encoding inflates it.
pub const SNAPSHOT_MAX_CHUNK_BYTES: u64 = 1024 * 1024;

/// Join attempts before giving up (non-fatal).
pub const JOIN_ATTEMPTS: u32 = 3;

/// Maximum accepted HTTP request body, in bytes.
pub const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Subdirectory of the data dir holding the index files.
pub const INDEX_DIR: &str = "index";

/// Subdirectory of the data dir holding retained snapshots.
pub const SNAPSHOTS_DIR: &str = "snapshots";

/// Sled database holding the Raft log.
pub const LOG_STORE_FILE: &str = "logstore.db";

/// Sled database holding Raft stable state (vote, committed, purge marker).
pub const STABLE_STORE_FILE: &str = "stablestore.db";

// ---- Index ----

/// Candidate list size during graph construction.
pub const EF_CONSTRUCTION: usize = 200;

/// Candidate list size during search, before the epsilon expansion factor
/// widens the reranked pool.
pub const EF_SEARCH: usize = 100;

/// Seed for graph builds. Fixed so the graph is a pure function of the
/// stored entries, identical on every replica.
pub const BUILD_SEED: u64 = 0x616e_6e65_78;

/// Maximum allowed vector dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per search request.
pub const MAX_K: usize = 10_000;

/// File holding the serialized vectors inside the index directory.
pub const INDEX_FILE: &str = "index.bin";

/// File holding index metadata (format version, dimension).
pub const META_FILE: &str = "meta.json";

/// On-disk format version written to the meta file.
pub const FORMAT_VERSION: u32 = 1;
