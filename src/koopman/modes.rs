//! The spectral mode set: merge-by-proximity registry with stability
//! scoring, eviction, and per-refresh snapshot persistence.

use std::io::Write as _;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::KoopmanError;
use crate::linalg::Complex32;

use super::dmd::RawMode;

/// A retained spectral mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectralMode {
    pub mode_id: String,
    pub eigenvalue: Complex32,
    /// Sparse coefficients over concept ids, ascending by id.
    pub coefficients: Vec<(u64, f32)>,
    /// EMA of per-refresh support, in [0, 1].
    pub stability: f32,
    /// Refresh version at which this mode last matched an extraction.
    pub last_seen_at: u64,
    /// Consecutive refreshes spent below the stability floor.
    #[serde(default)]
    below_floor_streak: u32,
    /// Coefficients at the last emitted coupling update.
    #[serde(default)]
    last_emitted: Option<Vec<(u64, f32)>>,
}

impl SpectralMode {
    /// L2 distance between current coefficients and the last emitted set.
    pub fn drift_since_emission(&self) -> f64 {
        match &self.last_emitted {
            None => l2_norm(&self.coefficients),
            Some(prev) => l2_norm(&diff_sparse(&self.coefficients, prev)),
        }
    }

    /// Sparse `(current − last_emitted)` diff, then record the emission.
    pub fn take_emission_diff(&mut self) -> Vec<(u64, f32)> {
        let diff = match &self.last_emitted {
            None => self.coefficients.clone(),
            Some(prev) => diff_sparse(&self.coefficients, prev),
        };
        self.last_emitted = Some(self.coefficients.clone());
        diff
    }
}

/// Merge/eviction parameters, drawn from the learner config per refresh.
pub struct MergeParams {
    pub eigen_merge_radius: f64,
    pub merge_cos_threshold: f64,
    pub stability_beta: f64,
    pub stability_floor: f64,
    pub eviction_window: u32,
}

/// The owned mode registry. Mutated only by the serialized refresh path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeSet {
    modes: Vec<SpectralMode>,
    next_seq: u64,
    refresh_version: u64,
}

impl ModeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The version the current contents correspond to.
    pub fn refresh_version(&self) -> u64 {
        self.refresh_version
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    /// Modes ordered by descending stability, capped at `max_modes`.
    pub fn top_modes(&self, max_modes: usize) -> Vec<SpectralMode> {
        let mut sorted = self.modes.clone();
        sorted.sort_by(|a, b| {
            b.stability
                .partial_cmp(&a.stability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted.truncate(max_modes);
        sorted
    }

    /// Mutable access for the emission pass.
    pub fn modes_mut(&mut self) -> &mut [SpectralMode] {
        &mut self.modes
    }

    /// Fold one refresh's raw modes into the set.
    ///
    /// Matching is eigenvalue proximity plus coefficient cosine similarity;
    /// matches blend coefficients by stability weight and update stability
    /// as an EMA of support. Unmatched existing modes decay toward zero
    /// support; modes below the floor for more than the eviction window are
    /// dropped. Returns `(new_modes, merged_modes, evicted_modes)`.
    pub fn merge_refresh(
        &mut self,
        raw: Vec<RawMode>,
        params: &MergeParams,
        refresh_version: u64,
    ) -> (usize, usize, usize) {
        self.refresh_version = refresh_version;
        let beta = params.stability_beta as f32;
        let mut matched: Vec<bool> = vec![false; self.modes.len()];
        let mut new_count = 0usize;
        let mut merged_count = 0usize;

        for raw_mode in raw {
            let eigenvalue = raw_mode.eigenvalue.to_c32();
            let best = self
                .modes
                .iter()
                .enumerate()
                .filter(|(i, m)| {
                    !matched[*i]
                        && f64::from(m.eigenvalue.dist(eigenvalue)) <= params.eigen_merge_radius
                        && cosine(&m.coefficients, &raw_mode.coefficients)
                            >= params.merge_cos_threshold
                })
                .min_by(|(_, a), (_, b)| {
                    let da = a.eigenvalue.dist(eigenvalue);
                    let db = b.eigenvalue.dist(eigenvalue);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);

            match best {
                Some(i) => {
                    let mode = &mut self.modes[i];
                    matched[i] = true;
                    merged_count += 1;
                    let weight = f64::from(mode.stability).max(1e-3);
                    mode.coefficients = blend_sparse(
                        &mode.coefficients,
                        &raw_mode.coefficients,
                        weight,
                    );
                    mode.eigenvalue = eigenvalue;
                    mode.stability =
                        ((1.0 - beta) * mode.stability + beta * raw_mode.support).clamp(0.0, 1.0);
                    mode.last_seen_at = refresh_version;
                }
                None => {
                    let id = format!("mode-{:06x}", self.next_seq);
                    self.next_seq += 1;
                    new_count += 1;
                    self.modes.push(SpectralMode {
                        mode_id: id,
                        eigenvalue,
                        coefficients: raw_mode.coefficients,
                        stability: raw_mode.support.clamp(0.0, 1.0),
                        last_seen_at: refresh_version,
                        below_floor_streak: 0,
                        last_emitted: None,
                    });
                    matched.push(true);
                }
            }
        }

        // Unmatched modes saw zero support this refresh.
        for (i, mode) in self.modes.iter_mut().enumerate() {
            if !matched.get(i).copied().unwrap_or(true) {
                mode.stability = ((1.0 - beta) * mode.stability).clamp(0.0, 1.0);
            }
        }

        // Eviction: sustained sub-floor stability.
        let floor = params.stability_floor as f32;
        for mode in self.modes.iter_mut() {
            if mode.stability < floor {
                mode.below_floor_streak += 1;
            } else {
                mode.below_floor_streak = 0;
            }
        }
        let window = params.eviction_window;
        let before = self.modes.len();
        self.modes.retain(|m| m.below_floor_streak <= window);
        let evicted = before - self.modes.len();

        (new_count, merged_count, evicted)
    }
}

/// Cosine similarity of two sparse coefficient vectors.
pub fn cosine(a: &[(u64, f32)], b: &[(u64, f32)]) -> f64 {
    let mut dot = 0.0f64;
    let (mut na, mut nb) = (0.0f64, 0.0f64);
    let mut i = 0usize;
    let mut j = 0usize;
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => {
                na += f64::from(a[i].1).powi(2);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                nb += f64::from(b[j].1).powi(2);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                dot += f64::from(a[i].1) * f64::from(b[j].1);
                na += f64::from(a[i].1).powi(2);
                nb += f64::from(b[j].1).powi(2);
                i += 1;
                j += 1;
            }
        }
    }
    for (_, v) in &a[i..] {
        na += f64::from(*v).powi(2);
    }
    for (_, v) in &b[j..] {
        nb += f64::from(*v).powi(2);
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        // Sign-insensitive: a mode and its negation are the same subspace.
        (dot / denom).abs()
    }
}

fn blend_sparse(a: &[(u64, f32)], b: &[(u64, f32)], weight_a: f64) -> Vec<(u64, f32)> {
    let wa = weight_a / (weight_a + 1.0);
    let wb = 1.0 - wa;
    // Align sign: blend b flipped if it opposes a.
    let flip = {
        let mut dot = 0.0f64;
        let mut i = 0usize;
        let mut j = 0usize;
        while i < a.len() && j < b.len() {
            match a[i].0.cmp(&b[j].0) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    dot += f64::from(a[i].1) * f64::from(b[j].1);
                    i += 1;
                    j += 1;
                }
            }
        }
        if dot < 0.0 { -1.0f64 } else { 1.0f64 }
    };

    let mut out: std::collections::BTreeMap<u64, f64> = std::collections::BTreeMap::new();
    for (concept, v) in a {
        *out.entry(*concept).or_default() += wa * f64::from(*v);
    }
    for (concept, v) in b {
        *out.entry(*concept).or_default() += wb * flip * f64::from(*v);
    }
    out.into_iter()
        .filter(|(_, v)| *v != 0.0)
        .map(|(concept, v)| (concept, v as f32))
        .collect()
}

fn diff_sparse(current: &[(u64, f32)], previous: &[(u64, f32)]) -> Vec<(u64, f32)> {
    let mut out: std::collections::BTreeMap<u64, f32> = std::collections::BTreeMap::new();
    for (concept, v) in current {
        out.insert(*concept, *v);
    }
    for (concept, v) in previous {
        *out.entry(*concept).or_insert(0.0) -= *v;
    }
    out.into_iter().filter(|(_, v)| *v != 0.0).collect()
}

fn l2_norm(v: &[(u64, f32)]) -> f64 {
    v.iter().map(|(_, x)| f64::from(*x).powi(2)).sum::<f64>().sqrt()
}

// ---------------------------------------------------------------------------
// Snapshot persistence
// ---------------------------------------------------------------------------

/// One bincode file per refresh version under the modes directory, with the
/// oldest files pruned down to the retention count.
///
/// Snapshots are written via temp file + fsync + atomic rename, like the
/// weight checkpoint, so a crash never leaves a torn file under a live
/// version name.
pub struct ModeSnapshotStore {
    dir: PathBuf,
}

const SNAPSHOT_TEMP: &str = "modes.tmp";

impl ModeSnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, KoopmanError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| KoopmanError::SnapshotIo { source })?;
        Ok(Self { dir })
    }

    fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("modes-v{version:012}.bin"))
    }

    /// Persist the set as `version` and prune old snapshots.
    pub fn save(&self, set: &ModeSet, retention: usize) -> Result<(), KoopmanError> {
        let bytes = bincode::serialize(set).map_err(|e| KoopmanError::SnapshotIo {
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
        })?;
        let temp = self.dir.join(SNAPSHOT_TEMP);
        {
            let mut file = std::fs::File::create(&temp)
                .map_err(|source| KoopmanError::SnapshotIo { source })?;
            file.write_all(&bytes)
                .map_err(|source| KoopmanError::SnapshotIo { source })?;
            file.sync_all()
                .map_err(|source| KoopmanError::SnapshotIo { source })?;
        }
        std::fs::rename(&temp, self.path_for(set.refresh_version()))
            .map_err(|source| KoopmanError::SnapshotIo { source })?;
        self.prune(retention)
    }

    fn prune(&self, retention: usize) -> Result<(), KoopmanError> {
        let mut versions = self.versions()?;
        if versions.len() <= retention {
            return Ok(());
        }
        versions.sort_unstable();
        let drop_count = versions.len() - retention;
        for version in versions.into_iter().take(drop_count) {
            let _ = std::fs::remove_file(self.path_for(version));
        }
        Ok(())
    }

    fn versions(&self) -> Result<Vec<u64>, KoopmanError> {
        let entries =
            std::fs::read_dir(&self.dir).map_err(|source| KoopmanError::SnapshotIo { source })?;
        let mut versions = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(v) = name
                .strip_prefix("modes-v")
                .and_then(|s| s.strip_suffix(".bin"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                versions.push(v);
            }
        }
        Ok(versions)
    }

    /// Load the newest readable snapshot, if any.
    ///
    /// An unreadable or undecodable file (e.g. left behind by an older
    /// build or a partial copy) is skipped in favour of the next-older
    /// version; losing a mode snapshot never blocks startup.
    pub fn load_latest(&self) -> Result<Option<ModeSet>, KoopmanError> {
        let mut versions = self.versions()?;
        versions.sort_unstable();
        while let Some(version) = versions.pop() {
            let bytes = match std::fs::read(self.path_for(version)) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(version, error = %e, "skipping unreadable mode snapshot");
                    continue;
                }
            };
            match bincode::deserialize(&bytes) {
                Ok(set) => return Ok(Some(set)),
                Err(e) => {
                    tracing::warn!(version, error = %e, "skipping corrupt mode snapshot");
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::C64;
    use tempfile::TempDir;

    fn raw(re: f64, im: f64, coeffs: &[(u64, f32)], support: f32) -> RawMode {
        RawMode {
            eigenvalue: C64::new(re, im),
            coefficients: coeffs.to_vec(),
            support,
        }
    }

    fn params() -> MergeParams {
        MergeParams {
            eigen_merge_radius: 0.05,
            merge_cos_threshold: 0.9,
            stability_beta: 0.5,
            stability_floor: 0.1,
            eviction_window: 2,
        }
    }

    #[test]
    fn cosine_handles_disjoint_and_identical() {
        let a = vec![(1u64, 1.0f32), (2, 1.0)];
        let b = vec![(3u64, 1.0f32)];
        assert_eq!(cosine(&a, &b), 0.0);
        assert!((cosine(&a, &a) - 1.0).abs() < 1e-9);
        // Sign-insensitive.
        let neg: Vec<(u64, f32)> = a.iter().map(|(c, v)| (*c, -v)).collect();
        assert!((cosine(&a, &neg) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn close_eigenvalues_merge_and_far_ones_do_not() {
        let mut set = ModeSet::new();
        let coeffs = [(1u64, 0.8f32), (2, 0.6)];
        set.merge_refresh(vec![raw(0.9, 0.1, &coeffs, 0.8)], &params(), 1);
        assert_eq!(set.len(), 1);

        // Same subspace, eigenvalue within radius: merge.
        let (n, m, e) = set.merge_refresh(vec![raw(0.91, 0.11, &coeffs, 0.6)], &params(), 2);
        assert_eq!((n, m, e), (0, 1, 0));
        assert_eq!(set.len(), 1);

        // Far eigenvalue: a second mode.
        let (n, _, _) = set.merge_refresh(vec![raw(0.5, -0.0, &coeffs, 0.5)], &params(), 3);
        assert_eq!(n, 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn dissimilar_coefficients_refuse_merge() {
        let mut set = ModeSet::new();
        set.merge_refresh(vec![raw(0.9, 0.0, &[(1, 1.0)], 0.8)], &params(), 1);
        let (n, m, _) =
            set.merge_refresh(vec![raw(0.9, 0.0, &[(2, 1.0)], 0.8)], &params(), 2);
        assert_eq!((n, m), (1, 0));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn stability_is_an_ema_and_eviction_needs_a_sustained_floor() {
        let mut set = ModeSet::new();
        let coeffs = [(1u64, 1.0f32)];
        set.merge_refresh(vec![raw(0.9, 0.0, &coeffs, 0.8)], &params(), 1);
        assert!((set.top_modes(1)[0].stability - 0.8).abs() < 1e-6);

        // Unmatched refreshes decay stability: 0.8 → 0.4 → 0.2 → 0.1 → ...
        for v in 2..=4u64 {
            set.merge_refresh(Vec::new(), &params(), v);
        }
        assert_eq!(set.len(), 1);
        let s = set.top_modes(1)[0].stability;
        assert!((s - 0.1).abs() < 1e-6);

        // Two more sub-floor refreshes exceed the window: evicted.
        set.merge_refresh(Vec::new(), &params(), 5);
        set.merge_refresh(Vec::new(), &params(), 6);
        let (_, _, evicted) = set.merge_refresh(Vec::new(), &params(), 7);
        assert!(set.is_empty());
        assert!(evicted <= 1);
    }

    #[test]
    fn emission_diff_tracks_changes() {
        let mut set = ModeSet::new();
        set.merge_refresh(vec![raw(0.9, 0.0, &[(1, 0.6), (2, 0.8)], 0.9)], &params(), 1);
        let mode = &mut set.modes_mut()[0];
        assert!(mode.drift_since_emission() > 0.9);
        let diff = mode.take_emission_diff();
        assert_eq!(diff.len(), 2);
        assert!(mode.drift_since_emission() < 1e-9);
    }

    #[test]
    fn snapshot_store_round_trip_and_retention() {
        let dir = TempDir::new().unwrap();
        let store = ModeSnapshotStore::open(dir.path()).unwrap();
        assert!(store.load_latest().unwrap().is_none());

        let mut set = ModeSet::new();
        for v in 1..=5u64 {
            set.merge_refresh(vec![raw(0.9, 0.0, &[(1, 1.0)], 0.9)], &params(), v);
            store.save(&set, 3).unwrap();
        }
        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded.refresh_version(), 5);
        assert_eq!(loaded.len(), 1);
        // Only the newest three snapshot files survive, and the write path
        // leaves no temp file behind.
        assert_eq!(store.versions().unwrap().len(), 3);
        assert!(!dir.path().join(SNAPSHOT_TEMP).exists());
    }

    #[test]
    fn corrupt_newest_snapshot_falls_back_to_older() {
        let dir = TempDir::new().unwrap();
        let store = ModeSnapshotStore::open(dir.path()).unwrap();

        let mut set = ModeSet::new();
        set.merge_refresh(vec![raw(0.9, 0.0, &[(1, 1.0)], 0.9)], &params(), 1);
        store.save(&set, 8).unwrap();

        // A torn file under the newest version name must not block loading.
        std::fs::write(dir.path().join("modes-v000000000002.bin"), b"garbage").unwrap();
        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded.refresh_version(), 1);
        assert_eq!(loaded.len(), 1);

        // Nothing readable at all: an empty result, not an error.
        std::fs::remove_file(dir.path().join("modes-v000000000001.bin")).unwrap();
        assert!(store.load_latest().unwrap().is_none());
    }
}
