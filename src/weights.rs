//! The concept-coupling weight matrix `W`.
//!
//! `W` is a sparse symmetric matrix over concept ids with a zero diagonal,
//! stored as a canonical `(min, max)` edge map. It follows a single-writer /
//! many-reader discipline: mutation happens inside a [`WriteTxn`] (one at a
//! time, guarded by a mutex), and readers take cheap [`WeightSnapshot`]
//! handles tagged with a monotonically increasing version. Snapshots are
//! immutable; a reader keeps seeing its version for as long as it holds the
//! `Arc`.
//!
//! Checkpoints are written as bincode triples `(i, j, w)` plus the version,
//! via write-to-temp + fsync + atomic rename, so a crash never leaves a torn
//! checkpoint behind.

use std::collections::{BTreeMap, HashMap};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};

use crate::concept::ConceptId;
use crate::error::WeightsError;

/// Result alias for weight-matrix operations.
pub type WeightsResult<T> = std::result::Result<T, WeightsError>;

/// Canonical undirected edge key: `(min, max)` of the two raw concept ids.
pub fn edge_key(a: ConceptId, b: ConceptId) -> (u64, u64) {
    let (x, y) = (a.get(), b.get());
    if x <= y { (x, y) } else { (y, x) }
}

/// An immutable, versioned view of `W`.
#[derive(Debug, Clone)]
pub struct WeightSnapshot {
    version: u64,
    edges: BTreeMap<(u64, u64), f32>,
    degrees: HashMap<u64, usize>,
}

impl WeightSnapshot {
    fn empty() -> Self {
        Self {
            version: 0,
            edges: BTreeMap::new(),
            degrees: HashMap::new(),
        }
    }

    fn from_edges(version: u64, edges: BTreeMap<(u64, u64), f32>) -> Self {
        let mut degrees: HashMap<u64, usize> = HashMap::new();
        for (i, j) in edges.keys() {
            *degrees.entry(*i).or_default() += 1;
            *degrees.entry(*j).or_default() += 1;
        }
        Self {
            version,
            edges,
            degrees,
        }
    }

    /// Version tag; advances by one per committed write.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Weight of the `(a, b)` edge; 0 for absent edges and the diagonal.
    pub fn get(&self, a: ConceptId, b: ConceptId) -> f32 {
        if a == b {
            return 0.0;
        }
        self.edges.get(&edge_key(a, b)).copied().unwrap_or(0.0)
    }

    /// Number of stored (non-zero) edges, `‖W‖₀`.
    pub fn nnz(&self) -> usize {
        self.edges.len()
    }

    /// Iterate edges in canonical order.
    pub fn edges(&self) -> impl Iterator<Item = (&(u64, u64), &f32)> {
        self.edges.iter()
    }

    /// Non-zero count in a concept's row.
    pub fn degree(&self, id: ConceptId) -> usize {
        self.degrees.get(&id.get()).copied().unwrap_or(0)
    }

    /// All concepts with at least one edge.
    pub fn touched_concepts(&self) -> impl Iterator<Item = u64> + '_ {
        self.degrees.keys().copied()
    }

    /// Per-concept degree map.
    pub fn degrees(&self) -> &HashMap<u64, usize> {
        &self.degrees
    }

    /// Bilinear energy `E(x) = −½ xᵀWx` for a sparse activation pattern.
    ///
    /// Concepts absent from the pattern contribute zero. Since `W` is
    /// symmetric with zero diagonal, `xᵀWx = 2·Σ_{i<j} W_ij x_i x_j`.
    pub fn energy(&self, pattern: &HashMap<u64, f32>) -> f64 {
        let mut sum = 0.0f64;
        for ((i, j), w) in &self.edges {
            let (Some(xi), Some(xj)) = (pattern.get(i), pattern.get(j)) else {
                continue;
            };
            sum += f64::from(*w) * f64::from(*xi) * f64::from(*xj);
        }
        -sum
    }

    /// Sum of squared edge weights (half the Frobenius norm squared).
    pub fn edge_mass(&self) -> f64 {
        self.edges.values().map(|w| f64::from(*w).powi(2)).sum()
    }

    /// Clone the edge map (used to seed a write transaction or a checkpoint).
    pub fn edge_map(&self) -> BTreeMap<(u64, u64), f32> {
        self.edges.clone()
    }
}

/// The shared weight matrix.
pub struct WeightMatrix {
    writer: Mutex<()>,
    current: RwLock<Arc<WeightSnapshot>>,
    version: AtomicU64,
    w_clip: f32,
    max_edges: usize,
}

impl WeightMatrix {
    /// Create an empty matrix at version 0.
    pub fn new(w_clip: f32, max_edges: usize) -> Self {
        Self {
            writer: Mutex::new(()),
            current: RwLock::new(Arc::new(WeightSnapshot::empty())),
            version: AtomicU64::new(0),
            w_clip,
            max_edges,
        }
    }

    /// Restore a matrix from checkpointed edges at a given version.
    pub fn restore(
        w_clip: f32,
        max_edges: usize,
        version: u64,
        edges: BTreeMap<(u64, u64), f32>,
    ) -> Self {
        let snapshot = Arc::new(WeightSnapshot::from_edges(version, edges));
        Self {
            writer: Mutex::new(()),
            current: RwLock::new(snapshot),
            version: AtomicU64::new(version),
            w_clip,
            max_edges,
        }
    }

    /// Current committed version without taking a snapshot.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Wait-free read: the latest committed snapshot.
    pub fn snapshot(&self) -> Arc<WeightSnapshot> {
        Arc::clone(&self.current.read().expect("weights lock poisoned"))
    }

    /// Begin the exclusive write transaction, blocking until available.
    pub fn begin(&self) -> WriteTxn<'_> {
        let guard = self.writer.lock().expect("weights writer poisoned");
        let staged = self.snapshot().edge_map();
        WriteTxn {
            _guard: guard,
            matrix: self,
            staged,
        }
    }

    /// Begin the exclusive write transaction, failing fast if a writer holds it.
    pub fn try_begin(&self) -> Option<WriteTxn<'_>> {
        let guard = self.writer.try_lock().ok()?;
        let staged = self.snapshot().edge_map();
        Some(WriteTxn {
            _guard: guard,
            matrix: self,
            staged,
        })
    }

    /// Magnitude clip applied to every stored entry.
    pub fn w_clip(&self) -> f32 {
        self.w_clip
    }

    fn publish(&self, edges: BTreeMap<(u64, u64), f32>) -> Arc<WeightSnapshot> {
        let next_version = self.version.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(WeightSnapshot::from_edges(next_version, edges));
        {
            let mut current = self.current.write().expect("weights lock poisoned");
            *current = Arc::clone(&snapshot);
        }
        self.version.store(next_version, Ordering::Release);
        snapshot
    }
}

/// The exclusive write transaction over `W`.
///
/// All edits stage into a private edge map; nothing is visible to readers
/// until [`WriteTxn::commit`]. Dropping the transaction abandons the edits.
pub struct WriteTxn<'a> {
    _guard: MutexGuard<'a, ()>,
    matrix: &'a WeightMatrix,
    staged: BTreeMap<(u64, u64), f32>,
}

impl<'a> WriteTxn<'a> {
    /// Staged weight for an edge.
    pub fn get(&self, a: ConceptId, b: ConceptId) -> f32 {
        if a == b {
            return 0.0;
        }
        self.staged.get(&edge_key(a, b)).copied().unwrap_or(0.0)
    }

    /// Set an edge weight. The diagonal is ignored; values are clipped to
    /// `±w_clip`; zeros delete the edge.
    pub fn set(&mut self, a: ConceptId, b: ConceptId, w: f32) {
        if a == b {
            return;
        }
        let clipped = w.clamp(-self.matrix.w_clip, self.matrix.w_clip);
        let key = edge_key(a, b);
        if clipped == 0.0 {
            self.staged.remove(&key);
        } else {
            self.staged.insert(key, clipped);
        }
    }

    /// Add `delta` to an edge weight (clipped, diagonal ignored).
    pub fn add(&mut self, a: ConceptId, b: ConceptId, delta: f32) {
        let current = self.get(a, b);
        self.set(a, b, current + delta);
    }

    /// Remove an edge outright.
    pub fn remove(&mut self, a: ConceptId, b: ConceptId) {
        self.staged.remove(&edge_key(a, b));
    }

    /// Replace the entire staged edge map (clipped, capped, zero-free).
    pub fn replace(&mut self, edges: BTreeMap<(u64, u64), f32>) {
        self.staged = edges;
        let clip = self.matrix.w_clip;
        for w in self.staged.values_mut() {
            *w = w.clamp(-clip, clip);
        }
        self.staged.retain(|(i, j), w| *w != 0.0 && i != j);
        enforce_edge_cap(&mut self.staged, self.matrix.max_edges);
    }

    /// The staged edge map (what `commit` will publish).
    pub fn staged(&self) -> &BTreeMap<(u64, u64), f32> {
        &self.staged
    }

    /// Number of staged edges.
    pub fn nnz(&self) -> usize {
        self.staged.len()
    }

    /// Commit the staged edges as the next version and return its snapshot.
    ///
    /// Enforces the `max_edges` bound by discarding the smallest-magnitude
    /// edges when the stage exceeds it.
    pub fn commit(mut self) -> Arc<WeightSnapshot> {
        enforce_edge_cap(&mut self.staged, self.matrix.max_edges);
        self.matrix.publish(self.staged)
    }

    /// Abandon the transaction; readers keep the previous version.
    pub fn abandon(self) {}
}

/// Drop the smallest-magnitude edges until the cap holds.
fn enforce_edge_cap(staged: &mut BTreeMap<(u64, u64), f32>, max_edges: usize) {
    if staged.len() <= max_edges {
        return;
    }
    let excess = staged.len() - max_edges;
    let mut by_magnitude: Vec<((u64, u64), f32)> =
        staged.iter().map(|(k, v)| (*k, v.abs())).collect();
    by_magnitude.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    for (key, _) in by_magnitude.into_iter().take(excess) {
        staged.remove(&key);
    }
    tracing::warn!(dropped = excess, max_edges, "edge cap enforced");
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

const CHECKPOINT_MAGIC: [u8; 8] = *b"ONRSWMX1";
const CHECKPOINT_FILE: &str = "weights.ckpt";
const CHECKPOINT_TEMP: &str = "weights.ckpt.tmp";

#[derive(Serialize, Deserialize)]
struct CheckpointRecord {
    magic: [u8; 8],
    version: u64,
    triples: Vec<(u64, u64, f32)>,
}

/// Atomic on-disk checkpoint for `W`.
pub struct WeightCheckpoint {
    dir: PathBuf,
}

impl WeightCheckpoint {
    /// Open (creating the directory if needed) a checkpoint location.
    pub fn open(dir: impl Into<PathBuf>) -> WeightsResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| WeightsError::CheckpointIo { source })?;
        Ok(Self { dir })
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILE)
    }

    /// Persist a snapshot: write temp, fsync, rename over the live file.
    pub fn save(&self, snapshot: &WeightSnapshot) -> WeightsResult<()> {
        let triples = snapshot.edges().map(|(&(i, j), &w)| (i, j, w)).collect();
        self.save_triples(snapshot.version(), triples, snapshot.nnz())
    }

    /// Persist a candidate edge map before it is published as `version`.
    ///
    /// Used by the scheduler to make the checkpoint durable ahead of the
    /// in-memory commit, so a checkpoint failure can abort the cycle without
    /// readers ever seeing the new version.
    pub fn save_edges(
        &self,
        version: u64,
        edges: &BTreeMap<(u64, u64), f32>,
    ) -> WeightsResult<()> {
        let triples = edges.iter().map(|(&(i, j), &w)| (i, j, w)).collect();
        self.save_triples(version, triples, edges.len())
    }

    fn save_triples(
        &self,
        version: u64,
        triples: Vec<(u64, u64, f32)>,
        nnz: usize,
    ) -> WeightsResult<()> {
        let record = CheckpointRecord {
            magic: CHECKPOINT_MAGIC,
            version,
            triples,
        };
        let bytes = bincode::serialize(&record).map_err(|e| WeightsError::CheckpointEncoding {
            message: e.to_string(),
        })?;

        let temp = self.dir.join(CHECKPOINT_TEMP);
        {
            let mut file = std::fs::File::create(&temp)
                .map_err(|source| WeightsError::CheckpointIo { source })?;
            file.write_all(&bytes)
                .map_err(|source| WeightsError::CheckpointIo { source })?;
            file.sync_all()
                .map_err(|source| WeightsError::CheckpointIo { source })?;
        }
        std::fs::rename(&temp, self.path())
            .map_err(|source| WeightsError::CheckpointIo { source })?;
        tracing::debug!(version, edges = nnz, "checkpointed W");
        Ok(())
    }

    /// Load the checkpoint, if one exists. Returns `(version, edges)`.
    pub fn load(&self) -> WeightsResult<Option<(u64, BTreeMap<(u64, u64), f32>)>> {
        let path = self.path();
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(WeightsError::CheckpointIo { source }),
        };
        let record: CheckpointRecord = bincode::deserialize(&bytes).map_err(|_| {
            WeightsError::Corrupt {
                path: path.display().to_string(),
            }
        })?;
        if record.magic != CHECKPOINT_MAGIC {
            return Err(WeightsError::Corrupt {
                path: path.display().to_string(),
            });
        }
        let mut edges = BTreeMap::new();
        for (i, j, w) in record.triples {
            if i != j && w != 0.0 {
                edges.insert(if i <= j { (i, j) } else { (j, i) }, w);
            }
        }
        Ok(Some((record.version, edges)))
    }

    /// Probe that the checkpoint directory is writable (used to clear the
    /// checkpoint-unhealthy latch).
    pub fn probe(&self) -> WeightsResult<()> {
        let probe = self.dir.join(".probe");
        std::fs::write(&probe, b"ok").map_err(|source| WeightsError::CheckpointIo { source })?;
        std::fs::remove_file(&probe).map_err(|source| WeightsError::CheckpointIo { source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    #[test]
    fn symmetric_access_and_zero_diagonal() {
        let matrix = WeightMatrix::new(1.0, 1000);
        let mut txn = matrix.begin();
        txn.set(cid(2), cid(1), 0.5);
        txn.set(cid(3), cid(3), 0.9); // diagonal ignored
        let snap = txn.commit();
        assert_eq!(snap.get(cid(1), cid(2)), 0.5);
        assert_eq!(snap.get(cid(2), cid(1)), 0.5);
        assert_eq!(snap.get(cid(3), cid(3)), 0.0);
        assert_eq!(snap.nnz(), 1);
        assert_eq!(snap.degree(cid(1)), 1);
        assert_eq!(snap.degree(cid(2)), 1);
    }

    #[test]
    fn clip_and_zero_removal() {
        let matrix = WeightMatrix::new(0.25, 1000);
        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 3.0);
        txn.set(cid(1), cid(3), -3.0);
        let snap = txn.commit();
        assert_eq!(snap.get(cid(1), cid(2)), 0.25);
        assert_eq!(snap.get(cid(1), cid(3)), -0.25);

        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 0.0);
        let snap = txn.commit();
        assert_eq!(snap.nnz(), 1);
    }

    #[test]
    fn versions_advance_and_snapshots_are_stable() {
        let matrix = WeightMatrix::new(1.0, 1000);
        assert_eq!(matrix.version(), 0);
        let before = matrix.snapshot();

        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 0.1);
        let after = txn.commit();

        assert_eq!(before.version(), 0);
        assert_eq!(before.nnz(), 0);
        assert_eq!(after.version(), 1);
        assert_eq!(matrix.version(), 1);
    }

    #[test]
    fn abandoned_txn_changes_nothing() {
        let matrix = WeightMatrix::new(1.0, 1000);
        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 0.7);
        txn.abandon();
        assert_eq!(matrix.version(), 0);
        assert_eq!(matrix.snapshot().nnz(), 0);
    }

    #[test]
    fn try_begin_fails_while_writer_active() {
        let matrix = WeightMatrix::new(1.0, 1000);
        let txn = matrix.begin();
        assert!(matrix.try_begin().is_none());
        drop(txn);
        assert!(matrix.try_begin().is_some());
    }

    #[test]
    fn edge_cap_drops_smallest_magnitudes() {
        let matrix = WeightMatrix::new(1.0, 2);
        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 0.9);
        txn.set(cid(1), cid(3), 0.1);
        txn.set(cid(2), cid(3), 0.5);
        let snap = txn.commit();
        assert_eq!(snap.nnz(), 2);
        assert_eq!(snap.get(cid(1), cid(3)), 0.0);
        assert_eq!(snap.get(cid(1), cid(2)), 0.9);
    }

    #[test]
    fn energy_of_aligned_pattern_is_negative() {
        let matrix = WeightMatrix::new(1.0, 1000);
        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 0.8);
        let snap = txn.commit();

        let mut aligned = HashMap::new();
        aligned.insert(1u64, 1.0f32);
        aligned.insert(2u64, 1.0f32);
        assert!(snap.energy(&aligned) < 0.0);

        let mut opposed = HashMap::new();
        opposed.insert(1u64, 1.0f32);
        opposed.insert(2u64, -1.0f32);
        assert!(snap.energy(&opposed) > 0.0);
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = TempDir::new().unwrap();
        let ckpt = WeightCheckpoint::open(dir.path()).unwrap();
        assert!(ckpt.load().unwrap().is_none());

        let matrix = WeightMatrix::new(1.0, 1000);
        let mut txn = matrix.begin();
        txn.set(cid(1), cid(2), 0.5);
        txn.set(cid(2), cid(3), -0.25);
        let snap = txn.commit();
        ckpt.save(&snap).unwrap();

        let (version, edges) = ckpt.load().unwrap().unwrap();
        assert_eq!(version, 1);
        let restored = WeightMatrix::restore(1.0, 1000, version, edges);
        let rsnap = restored.snapshot();
        assert_eq!(rsnap.get(cid(1), cid(2)), 0.5);
        assert_eq!(rsnap.get(cid(2), cid(3)), -0.25);
        assert_eq!(rsnap.version(), 1);
    }

    #[test]
    fn corrupt_checkpoint_is_reported() {
        let dir = TempDir::new().unwrap();
        let ckpt = WeightCheckpoint::open(dir.path()).unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILE), b"garbage").unwrap();
        assert!(matches!(
            ckpt.load(),
            Err(WeightsError::Corrupt { .. })
        ));
    }

    #[test]
    fn probe_succeeds_on_writable_dir() {
        let dir = TempDir::new().unwrap();
        let ckpt = WeightCheckpoint::open(dir.path()).unwrap();
        assert!(ckpt.probe().is_ok());
    }
}
