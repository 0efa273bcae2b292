//! Persistent Raft log store and the index state machine.
//!
//! `LogStore` implements `RaftLogStorage`/`RaftLogReader` over two sled
//! databases: `logstore.db` holds entries keyed by big-endian log index,
//! `stablestore.db` holds the vote, the committed marker, and the purge
//! marker. `StateMachineStore` implements `RaftStateMachine`: it owns the
//! index adapter behind a single mutex and snapshots the index directory as
//! an uncompressed tar archive, retained on disk by `SnapshotStore`.

use crate::cluster::types::{
    Command, CommandResponse, InsertPayload, NodeId, RemovePayload, TypeConfig, OP_INSERT,
    OP_REMOVE,
};
use crate::config;
use crate::index::{IndexAdapter, IndexError, SearchResult};
use openraft::storage::{LogFlushed, LogState, RaftLogStorage, RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, RaftLogReader, RaftSnapshotBuilder, SnapshotMeta,
    StorageError, StorageIOError, StoredMembership, Vote,
};
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::fs;
use std::io::{self, Cursor};
use std::ops::{Bound, RangeBounds};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

// ---- Log Store ----

/// Stable-store keys.
const KEY_VOTE: &[u8] = b"vote";
const KEY_COMMITTED: &[u8] = b"committed";
const KEY_LAST_PURGED: &[u8] = b"last_purged";

fn be(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Raft log storage backed by sled.
///
/// Entries are serialized as JSON (the same encoding they travel in over the
/// RPC plane). Appends are flushed before being acknowledged so an accepted
/// entry survives a crash.
#[derive(Debug, Clone)]
pub struct LogStore {
    log: sled::Db,
    stable: sled::Db,
}

impl LogStore {
    /// Open (or create) the log and stable databases under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, sled::Error> {
        let log = sled::open(data_dir.join(config::LOG_STORE_FILE))?;
        let stable = sled::open(data_dir.join(config::STABLE_STORE_FILE))?;
        Ok(Self { log, stable })
    }

    fn read_stable<T: serde::de::DeserializeOwned>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StorageError<NodeId>> {
        let raw = self
            .stable
            .get(key)
            .map_err(|e| StorageIOError::read(&e))?;
        match raw {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| StorageIOError::read(&e))?,
            )),
            None => Ok(None),
        }
    }

    fn write_stable<T: serde::Serialize>(
        &self,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(value).map_err(|e| StorageIOError::write(&e))?;
        self.stable
            .insert(key, bytes)
            .map_err(|e| StorageIOError::write(&e))?;
        self.stable
            .flush()
            .map_err(|e| StorageIOError::write(&e))?;
        Ok(())
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => i.saturating_add(1),
            Bound::Excluded(&i) => i,
            Bound::Unbounded => u64::MAX,
        };

        let mut entries = Vec::new();
        for kv in self.log.range(be(start)..be(end)) {
            let (_, value) = kv.map_err(|e| StorageIOError::read_logs(&e))?;
            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&value).map_err(|e| StorageIOError::read_logs(&e))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged: Option<LogId<NodeId>> = self.read_stable(KEY_LAST_PURGED)?;
        let last = match self
            .log
            .last()
            .map_err(|e| StorageIOError::read_logs(&e))?
        {
            Some((_, value)) => {
                let entry: Entry<TypeConfig> =
                    serde_json::from_slice(&value).map_err(|e| StorageIOError::read_logs(&e))?;
                Some(entry.log_id)
            }
            None => last_purged,
        };
        Ok(LogState {
            last_purged_log_id: last_purged,
            last_log_id: last,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_stable(KEY_VOTE, vote)
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        self.read_stable(KEY_VOTE)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>>,
    {
        for entry in entries {
            let bytes =
                serde_json::to_vec(&entry).map_err(|e| StorageIOError::write_logs(&e))?;
            self.log
                .insert(be(entry.log_id.index), bytes)
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }
        self.log
            .flush()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let keys: Vec<_> = self
            .log
            .range(be(log_id.index)..)
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        for key in keys {
            self.log
                .remove(key)
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }
        self.log
            .flush()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.write_stable(KEY_LAST_PURGED, &log_id)?;
        let keys: Vec<_> = self
            .log
            .range(..=be(log_id.index))
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| StorageIOError::write_logs(&e))?;
        for key in keys {
            self.log
                .remove(key)
                .map_err(|e| StorageIOError::write_logs(&e))?;
        }
        Ok(())
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.write_stable(KEY_COMMITTED, &committed)
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.read_stable(KEY_COMMITTED)?.flatten())
    }
}

// ---- Snapshot archive ----

/// Tar the contents of `dir` (recursively) into memory.
///
/// Entries carry mode 0644 and their exact byte length, with paths relative
/// to `dir`. Directory traversal is name-sorted so identical directory
/// contents produce identical archives.
pub fn archive_dir(dir: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, dir, Path::new(""))?;
    builder.into_inner()
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    root: &Path,
    rel: &Path,
) -> io::Result<()> {
    let mut entries: Vec<fs::DirEntry> =
        fs::read_dir(root.join(rel))?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let file_type = entry.file_type()?;
        let rel_path = rel.join(entry.file_name());
        if file_type.is_dir() {
            append_dir(builder, root, &rel_path)?;
        } else if file_type.is_file() {
            let data = fs::read(root.join(&rel_path))?;
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, &rel_path, data.as_slice())?;
        }
    }
    Ok(())
}

/// Extract a tar archive produced by [`archive_dir`] into `dir`.
pub fn extract_archive(data: &[u8], dir: &Path) -> io::Result<()> {
    let mut archive = tar::Archive::new(Cursor::new(data));
    archive.unpack(dir)
}

// ---- Snapshot store ----

/// File-backed snapshot retention under `<data-dir>/snapshots/`.
///
/// Each snapshot is a `<id>.tar` archive next to a `<id>.meta.json`. The
/// newest `retain` snapshots are kept; the latest survives restarts so a
/// rebooted node can both restore itself and serve laggards.
#[derive(Debug)]
struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    fn open(dir: PathBuf, retain: usize) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, retain })
    }

    fn persist(
        &self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        data: &[u8],
    ) -> io::Result<()> {
        let stem = &meta.snapshot_id;
        let meta_bytes = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
        write_atomic(&self.dir.join(format!("{stem}.tar")), data)?;
        write_atomic(&self.dir.join(format!("{stem}.meta.json")), &meta_bytes)?;
        self.prune()?;
        Ok(())
    }

    fn load_latest(
        &self,
    ) -> io::Result<Option<(SnapshotMeta<NodeId, BasicNode>, Vec<u8>)>> {
        let mut latest: Option<(u64, SnapshotMeta<NodeId, BasicNode>)> = None;
        for (index, meta, _) in self.list()? {
            if latest.as_ref().map_or(true, |(i, _)| index >= *i) {
                latest = Some((index, meta));
            }
        }
        match latest {
            Some((_, meta)) => {
                let data = fs::read(self.dir.join(format!("{}.tar", meta.snapshot_id)))?;
                Ok(Some((meta, data)))
            }
            None => Ok(None),
        }
    }

    /// All stored snapshots as `(last_log_index, meta, meta_path)`.
    fn list(
        &self,
    ) -> io::Result<Vec<(u64, SnapshotMeta<NodeId, BasicNode>, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.to_string_lossy().ends_with(".meta.json") {
                continue;
            }
            let raw = fs::read(&path)?;
            let meta: SnapshotMeta<NodeId, BasicNode> = match serde_json::from_slice(&raw) {
                Ok(meta) => meta,
                Err(err) => {
                    tracing::warn!(?path, %err, "skipping unreadable snapshot meta");
                    continue;
                }
            };
            let index = meta.last_log_id.map_or(0, |id| id.index);
            found.push((index, meta, path));
        }
        Ok(found)
    }

    fn prune(&self) -> io::Result<()> {
        let mut found = self.list()?;
        if found.len() <= self.retain {
            return Ok(());
        }
        found.sort_by_key(|(index, _, _)| std::cmp::Reverse(*index));
        for (_, meta, meta_path) in found.into_iter().skip(self.retain) {
            let _ = fs::remove_file(self.dir.join(format!("{}.tar", meta.snapshot_id)));
            let _ = fs::remove_file(meta_path);
        }
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

// ---- State Machine Store ----

/// Abort the replica: a committed entry it cannot apply means every
/// alternative (skip, retry) leaves this node diverged from its peers.
fn fatal(context: &str, err: &dyn fmt::Display) -> ! {
    tracing::error!(context, error = %err, "cannot apply committed log entry; terminating replica");
    std::process::exit(1);
}

/// Raft state machine that applies committed commands to the index adapter.
///
/// One mutex guards every adapter access — apply, snapshot, restore, and
/// client-facing search — because the index is not safe for concurrent
/// mutation and snapshot capture requires a quiescent writer.
#[derive(Debug)]
pub struct StateMachineStore {
    adapter: Mutex<IndexAdapter>,
    last_applied_log: RwLock<Option<LogId<NodeId>>>,
    last_membership: RwLock<StoredMembership<NodeId, BasicNode>>,
    snapshot_idx: AtomicU64,
    snapshots: SnapshotStore,
}

impl StateMachineStore {
    /// Build the state machine for `index_dir`, recovering from the latest
    /// retained snapshot when one exists.
    ///
    /// The index directory is wiped first: its authoritative content is
    /// always snapshot + log replay, never whatever a previous process left
    /// behind.
    pub fn new(
        index_dir: &Path,
        dimension: usize,
        snapshots_dir: &Path,
    ) -> Result<Self, IndexError> {
        let snapshots = SnapshotStore::open(snapshots_dir.to_path_buf(), config::SNAPSHOT_RETAIN)?;

        let mut adapter = IndexAdapter::new(index_dir, dimension);
        adapter.wipe()?;

        let mut last_applied = None;
        let mut last_membership = StoredMembership::default();
        match snapshots.load_latest()? {
            Some((meta, data)) => {
                extract_archive(&data, adapter.dir())?;
                adapter.reopen()?;
                tracing::info!(
                    snapshot_id = %meta.snapshot_id,
                    vectors = adapter.len(),
                    "restored index from retained snapshot"
                );
                last_applied = meta.last_log_id;
                last_membership = meta.last_membership;
            }
            None => {
                adapter.reopen()?;
            }
        }

        Ok(Self {
            adapter: Mutex::new(adapter),
            last_applied_log: RwLock::new(last_applied),
            last_membership: RwLock::new(last_membership),
            snapshot_idx: AtomicU64::new(0),
            snapshots,
        })
    }

    /// Client-facing search against the local replica, serialized with
    /// writes through the adapter mutex.
    pub fn search(
        &self,
        query: &[f64],
        k: usize,
        epsilon: f64,
    ) -> Result<Vec<SearchResult>, IndexError> {
        self.adapter.lock().search(query, k, epsilon)
    }

    /// Number of live vectors on this replica.
    pub fn vector_count(&self) -> usize {
        self.adapter.lock().len()
    }

    pub fn dimension(&self) -> usize {
        self.adapter.lock().dimension()
    }

    fn apply_command(&self, cmd: &Command) -> CommandResponse {
        match cmd.op.as_str() {
            OP_INSERT => {
                let payload: InsertPayload = match serde_json::from_slice(&cmd.payload) {
                    Ok(payload) => payload,
                    Err(err) => fatal("decode insert payload", &err),
                };
                match self.adapter.lock().insert(&payload.vector) {
                    Ok(id) => CommandResponse::inserted(id),
                    Err(err) => fatal("apply insert", &err),
                }
            }
            OP_REMOVE => {
                let payload: RemovePayload = match serde_json::from_slice(&cmd.payload) {
                    Ok(payload) => payload,
                    Err(err) => fatal("decode remove payload", &err),
                };
                match self.adapter.lock().remove(payload.id) {
                    Ok(()) => CommandResponse::empty(),
                    Err(err) => fatal("apply remove", &err),
                }
            }
            other => fatal("unknown command op", &other),
        }
    }
}

impl RaftSnapshotBuilder<TypeConfig> for std::sync::Arc<StateMachineStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let last_applied = *self.last_applied_log.read().await;
        let last_membership = self.last_membership.read().await.clone();

        // Flush the index and capture the directory while holding the
        // adapter mutex, so no write lands mid-archive.
        let data = {
            let adapter = self.adapter.lock();
            adapter
                .save()
                .map_err(|e| StorageIOError::read_state_machine(&e))?;
            archive_dir(adapter.dir()).map_err(|e| StorageIOError::read_state_machine(&e))?
        };

        let idx = self.snapshot_idx.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot_id = if let Some(last) = last_applied {
            format!("{}-{}-{}", last.leader_id, last.index, idx)
        } else {
            format!("--{}", idx)
        };

        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership,
            snapshot_id,
        };

        self.snapshots
            .persist(&meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        tracing::info!(snapshot_id = %meta.snapshot_id, bytes = data.len(), "snapshot built");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for std::sync::Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let last = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last, membership))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut responses = Vec::new();
        for entry in entries {
            *self.last_applied_log.write().await = Some(entry.log_id);

            let resp = match &entry.payload {
                EntryPayload::Blank => CommandResponse::empty(),
                EntryPayload::Normal(cmd) => self.apply_command(cmd),
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    CommandResponse::empty()
                }
            };
            responses.push(resp);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.into_inner();

        {
            let mut adapter = self.adapter.lock();
            adapter
                .wipe()
                .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
            extract_archive(&data, adapter.dir())
                .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
            adapter
                .reopen()
                .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        }

        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await = meta.last_membership.clone();

        self.snapshots
            .persist(meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;

        tracing::info!(snapshot_id = %meta.snapshot_id, "snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let latest = self
            .snapshots
            .load_latest()
            .map_err(|e| StorageIOError::read_snapshot(None, &e))?;
        Ok(latest.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}
