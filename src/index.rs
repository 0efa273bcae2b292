//! Thread-exclusive adapter around the external ANN index library.
//!
//! The index itself is [instant_distance]'s HNSW. This module owns the
//! on-disk index directory and presents the synchronous surface the state
//! machine drives: open, close, insert, remove, search, save, wipe. Graph
//! builds are seeded, so replicas holding the same vector set hold identical
//! graphs. The adapter is not internally thread-safe; the state machine
//! serializes all access behind one mutex.

use crate::config;
use instant_distance::{Builder, HnswMap, Point, Search};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Errors surfaced by the adapter.
#[derive(Debug)]
pub enum IndexError {
    /// The adapter was used while closed.
    Closed,
    /// A vector's length does not match the index dimension.
    DimensionMismatch { expected: usize, actual: usize },
    /// A configuration or argument value is out of range.
    InvalidArgument(String),
    /// On-disk state failed checksum or invariant validation.
    Corrupt(String),
    /// Underlying filesystem error.
    Io(io::Error),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::Closed => write!(f, "index is closed"),
            IndexError::DimensionMismatch { expected, actual } => {
                write!(f, "dimension mismatch: expected {expected}, got {actual}")
            }
            IndexError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            IndexError::Corrupt(msg) => write!(f, "corrupt index: {msg}"),
            IndexError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IndexError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for IndexError {
    fn from(err: io::Error) -> Self {
        IndexError::Io(err)
    }
}

/// One search hit: the id assigned at insert time and the exact squared
/// euclidean distance to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchResult {
    pub id: u64,
    pub distance: f64,
}

/// A stored vector. The library navigates with this `Point` impl (squared
/// euclidean, truncated to `f32`); final distances are recomputed in `f64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vector(Vec<f64>);

impl Point for Vector {
    fn distance(&self, other: &Self) -> f32 {
        euclidean_sq(&self.0, &other.0) as f32
    }
}

fn euclidean_sq(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Live index state: the entries in insert order plus the graph built over
/// them. Ids are dense from 0 and never reused; removal drops the entry and
/// rebuilds, like the native library's remove-then-rebuild cycle.
struct IndexState {
    next_id: u64,
    entries: Vec<(u64, Vector)>,
    map: Option<HnswMap<Vector, u64>>,
}

impl IndexState {
    fn empty() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
            map: None,
        }
    }

    /// Rebuild the graph from the current entries with a fixed seed, so the
    /// result is a pure function of the entry sequence.
    fn rebuild(&mut self) {
        if self.entries.is_empty() {
            self.map = None;
            return;
        }
        let points: Vec<Vector> = self.entries.iter().map(|(_, v)| v.clone()).collect();
        let ids: Vec<u64> = self.entries.iter().map(|(id, _)| *id).collect();
        self.map = Some(
            Builder::default()
                .ef_construction(config::EF_CONSTRUCTION)
                .ef_search(config::EF_SEARCH)
                .seed(config::BUILD_SEED)
                .build(points, ids),
        );
    }
}

/// Exclusive owner of one index directory.
pub struct IndexAdapter {
    dir: PathBuf,
    dimension: usize,
    state: Option<IndexState>,
}

impl fmt::Debug for IndexAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexAdapter")
            .field("dir", &self.dir)
            .field("dimension", &self.dimension)
            .field("open", &self.state.is_some())
            .field("len", &self.len())
            .finish()
    }
}

impl IndexAdapter {
    /// Create an adapter handle bound to `dir` without touching the
    /// directory. The adapter starts closed.
    pub fn new(dir: &Path, dimension: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            dimension,
            state: None,
        }
    }

    /// Open (or create) the index at `dir` with the given dimension.
    ///
    /// A freshly created index is committed to disk immediately so that
    /// subsequent opens find a valid structure. Opening an existing index
    /// whose dimension differs is an error.
    pub fn open(dir: &Path, dimension: usize) -> Result<Self, IndexError> {
        let mut adapter = Self::new(dir, dimension);
        adapter.reopen()?;
        Ok(adapter)
    }

    /// Load the directory into memory, creating and committing an empty
    /// index when the directory holds none. Idempotent after
    /// [`close`](Self::close).
    pub fn reopen(&mut self) -> Result<(), IndexError> {
        self.close();
        if self.dimension == 0 || self.dimension > config::MAX_DIMENSION {
            return Err(IndexError::InvalidArgument(format!(
                "dimension must be in 1..={}, got {}",
                config::MAX_DIMENSION,
                self.dimension
            )));
        }
        fs::create_dir_all(&self.dir)?;
        let state = if index_exists(&self.dir) {
            load_index(&self.dir, self.dimension)?
        } else {
            let state = IndexState::empty();
            save_index(&self.dir, &state, self.dimension)?;
            state
        };
        self.state = Some(state);
        Ok(())
    }

    /// Release the in-memory index. Idempotent.
    pub fn close(&mut self) {
        self.state = None;
    }

    /// The directory this adapter owns.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of live vectors, or 0 while closed.
    pub fn len(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> Result<&IndexState, IndexError> {
        self.state.as_ref().ok_or(IndexError::Closed)
    }

    fn state_mut(&mut self) -> Result<&mut IndexState, IndexError> {
        self.state.as_mut().ok_or(IndexError::Closed)
    }

    /// Insert a vector, rebuild the graph, commit the index, and return the
    /// assigned id.
    pub fn insert(&mut self, vector: &[f64]) -> Result<u64, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let dir = self.dir.clone();
        let dimension = self.dimension;
        let state = self.state_mut()?;
        let id = state.next_id;
        state.next_id += 1;
        state.entries.push((id, Vector(vector.to_vec())));
        state.rebuild();
        save_index(&dir, state, dimension)?;
        Ok(id)
    }

    /// Remove a vector by id, rebuilding and committing the index.
    ///
    /// An unknown id is a no-op success (nothing to rebuild, no save), which
    /// keeps remove idempotent when a client retries across a leader change.
    pub fn remove(&mut self, id: u64) -> Result<(), IndexError> {
        let dir = self.dir.clone();
        let dimension = self.dimension;
        let state = self.state_mut()?;
        let before = state.entries.len();
        state.entries.retain(|(entry_id, _)| *entry_id != id);
        if state.entries.len() == before {
            return Ok(());
        }
        state.rebuild();
        save_index(&dir, state, dimension)?;
        Ok(())
    }

    /// Up to `k` nearest neighbors, ascending by exact distance.
    ///
    /// `epsilon` widens the candidate pool taken from the library before
    /// reranking: `ceil(k * (1 + epsilon))` candidates are pulled and scored
    /// with exact `f64` distances.
    pub fn search(
        &self,
        query: &[f64],
        k: usize,
        epsilon: f64,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k > config::MAX_K {
            return Err(IndexError::InvalidArgument(format!(
                "k must be <= {}, got {k}",
                config::MAX_K
            )));
        }
        let state = self.state()?;
        let map = match &state.map {
            Some(map) => map,
            None => return Ok(Vec::new()),
        };

        let pool = ((k as f64) * (1.0 + epsilon.max(0.0))).ceil() as usize;
        let probe = Vector(query.to_vec());
        let mut search = Search::default();
        let mut hits: Vec<SearchResult> = map
            .search(&probe, &mut search)
            .take(pool.max(k))
            .map(|item| SearchResult {
                id: *item.value,
                distance: euclidean_sq(query, &item.point.0),
            })
            .collect();
        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Flush the current state to disk.
    pub fn save(&self) -> Result<(), IndexError> {
        save_index(&self.dir, self.state()?, self.dimension)
    }

    /// Close, recursively remove the directory, and recreate it empty.
    ///
    /// The adapter stays closed; callers restore content and then
    /// [`reopen`](Self::reopen).
    pub fn wipe(&mut self) -> Result<(), IndexError> {
        self.close();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

// ---- Directory persistence ----
//
// Two files: `meta.json` (format version, dimension) and `index.bin`
// (bincode entries with a 4-byte magic and CRC32 footer). Writes go through
// a temp file and rename so a crash never leaves a half-written index. The
// graph itself is not persisted; it is rebuilt from the entries on load,
// which yields the same graph on every replica.

/// Magic bytes appended before the CRC32 footer of `index.bin`.
const INDEX_CRC_MAGIC: &[u8; 4] = b"AXI1";

/// Contents of `meta.json`.
#[derive(Debug, Serialize, Deserialize)]
struct IndexMeta {
    format_version: u32,
    dimension: usize,
}

/// Contents of `index.bin`.
#[derive(Debug, Serialize, Deserialize)]
struct SavedIndex {
    next_id: u64,
    entries: Vec<(u64, Vec<f64>)>,
}

fn index_exists(dir: &Path) -> bool {
    dir.join(config::META_FILE).is_file() && dir.join(config::INDEX_FILE).is_file()
}

fn save_index(dir: &Path, state: &IndexState, dimension: usize) -> Result<(), IndexError> {
    fs::create_dir_all(dir)?;

    let meta = IndexMeta {
        format_version: config::FORMAT_VERSION,
        dimension,
    };
    let meta_bytes =
        serde_json::to_vec_pretty(&meta).map_err(|e| IndexError::Corrupt(e.to_string()))?;
    write_atomic(&dir.join(config::META_FILE), &meta_bytes)?;

    let saved = SavedIndex {
        next_id: state.next_id,
        entries: state
            .entries
            .iter()
            .map(|(id, v)| (*id, v.0.clone()))
            .collect(),
    };
    let payload = bincode::serialize(&saved).map_err(|e| IndexError::Corrupt(e.to_string()))?;
    let crc = crc32fast::hash(&payload);
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&payload);
    out.extend_from_slice(INDEX_CRC_MAGIC);
    out.extend_from_slice(&crc.to_be_bytes());
    write_atomic(&dir.join(config::INDEX_FILE), &out)?;

    tracing::debug!(
        entries = saved.entries.len(),
        bytes = payload.len(),
        "saved index (crc {crc:#010x})"
    );
    Ok(())
}

fn load_index(dir: &Path, dimension: usize) -> Result<IndexState, IndexError> {
    let meta_raw = fs::read(dir.join(config::META_FILE))?;
    let meta: IndexMeta =
        serde_json::from_slice(&meta_raw).map_err(|e| IndexError::Corrupt(e.to_string()))?;
    if meta.format_version != config::FORMAT_VERSION {
        return Err(IndexError::Corrupt(format!(
            "unsupported format version {}",
            meta.format_version
        )));
    }
    if meta.dimension != dimension {
        return Err(IndexError::DimensionMismatch {
            expected: dimension,
            actual: meta.dimension,
        });
    }

    let raw = fs::read(dir.join(config::INDEX_FILE))?;
    if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != INDEX_CRC_MAGIC {
        return Err(IndexError::Corrupt("missing CRC32 footer".to_string()));
    }
    let payload = &raw[..raw.len() - 8];
    let stored_crc = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(IndexError::Corrupt(format!(
            "CRC32 mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    let saved: SavedIndex =
        bincode::deserialize(payload).map_err(|e| IndexError::Corrupt(e.to_string()))?;
    for (id, vector) in &saved.entries {
        if vector.len() != dimension {
            return Err(IndexError::Corrupt(format!(
                "entry {id} has length {} != dimension {dimension}",
                vector.len()
            )));
        }
        if *id >= saved.next_id {
            return Err(IndexError::Corrupt(format!(
                "entry id {id} >= next_id {}",
                saved.next_id
            )));
        }
    }

    let mut state = IndexState {
        next_id: saved.next_id,
        entries: saved
            .entries
            .into_iter()
            .map(|(id, v)| (id, Vector(v)))
            .collect(),
        map: None,
    };
    state.rebuild();
    tracing::debug!(entries = state.entries.len(), dimension, "loaded index");
    Ok(state)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), IndexError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_and_commits_empty_index() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        let adapter = IndexAdapter::open(&dir, 2).unwrap();
        assert!(adapter.is_empty());
        // The empty index must already be on disk
        assert!(index_exists(&dir));
    }

    #[test]
    fn test_open_rejects_zero_dimension() {
        let tmp = TempDir::new().unwrap();
        assert!(IndexAdapter::open(&tmp.path().join("index"), 0).is_err());
    }

    #[test]
    fn test_open_is_idempotent_against_close() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        let mut adapter = IndexAdapter::open(&dir, 2).unwrap();
        adapter.insert(&[1.0, 0.0]).unwrap();
        adapter.close();
        adapter.close();
        adapter.reopen().unwrap();
        assert_eq!(adapter.len(), 1);
    }

    #[test]
    fn test_open_rejects_dimension_change() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        IndexAdapter::open(&dir, 2).unwrap();
        assert!(IndexAdapter::open(&dir, 3).is_err());
    }

    #[test]
    fn test_insert_assigns_sequential_ids() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        assert_eq!(adapter.insert(&[1.0, 0.0]).unwrap(), 0);
        assert_eq!(adapter.insert(&[0.0, 1.0]).unwrap(), 1);
        assert_eq!(adapter.len(), 2);
    }

    #[test]
    fn test_insert_wrong_dimension() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        let err = adapter.insert(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_search_finds_inserted_id() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        let id = adapter.insert(&[1.0, 0.0]).unwrap();
        adapter.insert(&[0.0, 1.0]).unwrap();
        let hits = adapter.search(&[1.0, 0.0], 1, 0.1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert_eq!(hits[0].distance, 0.0);
    }

    #[test]
    fn test_search_wrong_dimension() {
        let tmp = TempDir::new().unwrap();
        let adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        assert!(adapter.search(&[1.0], 1, 0.0).is_err());
    }

    #[test]
    fn test_search_empty_index_returns_nothing() {
        let tmp = TempDir::new().unwrap();
        let adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        assert!(adapter.search(&[1.0, 0.0], 5, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_search_results_ascending_and_truncated() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        for x in 0..5 {
            for y in 0..5 {
                adapter.insert(&[f64::from(x), f64::from(y)]).unwrap();
            }
        }
        let hits = adapter.search(&[2.2, 2.2], 7, 0.5).unwrap();
        assert_eq!(hits.len(), 7);
        for pair in hits.windows(2) {
            assert!(pair[0].distance <= pair[1].distance);
        }
    }

    #[test]
    fn test_remove_unknown_id_is_noop_success() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        adapter.remove(42).unwrap();
        adapter.remove(42).unwrap();
    }

    #[test]
    fn test_remove_then_search_excludes_id() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        let id = adapter.insert(&[1.0, 0.0]).unwrap();
        adapter.insert(&[0.0, 1.0]).unwrap();
        adapter.remove(id).unwrap();
        let hits = adapter.search(&[1.0, 0.0], 2, 0.0).unwrap();
        assert!(hits.iter().all(|h| h.id != id));
        assert_eq!(adapter.len(), 1);
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        adapter.insert(&[1.0, 0.0]).unwrap();
        adapter.remove(0).unwrap();
        assert_eq!(adapter.insert(&[0.0, 1.0]).unwrap(), 1);
    }

    #[test]
    fn test_same_op_sequence_gives_identical_results() {
        let run = |dir: &Path| {
            let mut adapter = IndexAdapter::open(dir, 2).unwrap();
            for i in 0..30u32 {
                adapter
                    .insert(&[(f64::from(i) * 0.37).sin(), (f64::from(i) * 0.91).cos()])
                    .unwrap();
            }
            adapter.remove(7).unwrap();
            adapter.remove(23).unwrap();
            adapter.insert(&[0.5, 0.5]).unwrap();
            adapter.search(&[0.4, 0.6], 5, 0.2).unwrap()
        };
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        assert_eq!(run(&tmp_a.path().join("a")), run(&tmp_b.path().join("b")));
    }

    #[test]
    fn test_insert_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        let before = {
            let mut adapter = IndexAdapter::open(&dir, 2).unwrap();
            for i in 0..10u32 {
                adapter.insert(&[f64::from(i), 0.5]).unwrap();
            }
            adapter.remove(4).unwrap();
            adapter.search(&[3.1, 0.5], 3, 0.1).unwrap()
        };
        let adapter = IndexAdapter::open(&dir, 2).unwrap();
        assert_eq!(adapter.len(), 9);
        assert_eq!(adapter.search(&[3.1, 0.5], 3, 0.1).unwrap(), before);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        {
            let mut adapter = IndexAdapter::open(&dir, 2).unwrap();
            adapter.insert(&[1.0, 0.0]).unwrap();
        }
        let path = dir.join(config::INDEX_FILE);
        let mut raw = fs::read(&path).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0xFF;
        fs::write(&path, &raw).unwrap();

        let err = IndexAdapter::open(&dir, 2).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)), "got {err}");
    }

    #[test]
    fn test_truncated_file_detected() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        IndexAdapter::open(&dir, 2).unwrap();
        fs::write(dir.join(config::INDEX_FILE), b"short").unwrap();
        assert!(IndexAdapter::open(&dir, 2).is_err());
    }

    #[test]
    fn test_wipe_empties_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        let mut adapter = IndexAdapter::open(&dir, 2).unwrap();
        adapter.insert(&[1.0, 0.0]).unwrap();
        adapter.wipe().unwrap();
        assert!(!index_exists(&dir));
        adapter.reopen().unwrap();
        assert!(adapter.is_empty());
    }

    #[test]
    fn test_use_while_closed_errors() {
        let tmp = TempDir::new().unwrap();
        let mut adapter = IndexAdapter::open(&tmp.path().join("index"), 2).unwrap();
        adapter.close();
        assert!(matches!(
            adapter.insert(&[1.0, 0.0]),
            Err(IndexError::Closed)
        ));
        assert!(matches!(
            adapter.search(&[1.0, 0.0], 1, 0.0),
            Err(IndexError::Closed)
        ));
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("index");
        let mut adapter = IndexAdapter::open(&dir, 2).unwrap();
        adapter.insert(&[1.0, 0.0]).unwrap();
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
