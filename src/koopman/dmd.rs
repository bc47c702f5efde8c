//! Streaming sparse DMD over a rolling buffer of activation snapshots.
//!
//! The buffer holds the most recent `H` one-step snapshot pairs `(x_t,
//! x_{t+1})`, deduplicated on `(episode_id, step)`, in a growing global
//! concept index (snapshots that predate a concept are implicitly zero in
//! its row). A refresh builds the snapshot matrices, takes the truncated
//! SVD of `X`, eigendecomposes the reduced operator `Ã = UᵀYVΣ⁻¹`, and
//! lifts the eigenvectors to sparse modes `Φ = YVΣ⁻¹w`.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::episode::EpisodeId;
use crate::linalg::{C64, DMat, NonConvergence, eigenvalues, eigenvector, truncated_svd};

/// The observable map applied to raw activation snapshots before the
/// decomposition.
///
/// The default [`IdentityMap`] keeps the concept-activation space itself;
/// richer dictionaries (polynomial, radial) can be plugged in through the
/// learner configuration without touching the refresh path.
pub trait FeatureMap: Send + Sync {
    /// Map one sparse snapshot (concept id → activation) to the observable
    /// space, still keyed by concept id.
    fn apply(&self, snapshot: &HashMap<u64, f32>) -> HashMap<u64, f64>;
}

/// Identity observables: the activation vector itself.
pub struct IdentityMap;

impl FeatureMap for IdentityMap {
    fn apply(&self, snapshot: &HashMap<u64, f32>) -> HashMap<u64, f64> {
        snapshot.iter().map(|(&k, &v)| (k, f64::from(v))).collect()
    }
}

/// One buffered snapshot pair in sparse form.
struct Pair {
    key: (EpisodeId, u32),
    x: HashMap<u64, f64>,
    y: HashMap<u64, f64>,
}

/// Rolling deduplicated buffer of snapshot pairs.
pub struct SnapshotBuffer {
    capacity: usize,
    pairs: VecDeque<Pair>,
    seen: HashSet<(EpisodeId, u32)>,
    /// Global concept index: id → dense row. Rows are only ever appended.
    index: HashMap<u64, usize>,
    order: Vec<u64>,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            pairs: VecDeque::new(),
            seen: HashSet::new(),
            index: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Number of buffered pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Ambient dimension (concepts ever observed).
    pub fn dim(&self) -> usize {
        self.order.len()
    }

    fn intern(&mut self, concept: u64) -> usize {
        if let Some(&row) = self.index.get(&concept) {
            return row;
        }
        let row = self.order.len();
        self.index.insert(concept, row);
        self.order.push(concept);
        row
    }

    /// Append one pair if its `(episode_id, step)` key is new. Returns
    /// whether it was accepted. The oldest pair is evicted on overflow.
    pub fn push(
        &mut self,
        key: (EpisodeId, u32),
        x: HashMap<u64, f64>,
        y: HashMap<u64, f64>,
    ) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        for concept in x.keys().chain(y.keys()) {
            self.intern(*concept);
        }
        self.pairs.push_back(Pair { key, x, y });
        if self.pairs.len() > self.capacity {
            if let Some(old) = self.pairs.pop_front() {
                self.seen.remove(&old.key);
            }
        }
        true
    }

    /// Concept id for a dense row.
    pub fn concept_at(&self, row: usize) -> u64 {
        self.order[row]
    }

    /// Dense snapshot matrices `(X, Y)`, one column per pair.
    fn matrices(&self) -> (DMat, DMat) {
        let n = self.dim();
        let columns_x: Vec<Vec<f64>> = self
            .pairs
            .iter()
            .map(|p| densify(n, &self.index, &p.x))
            .collect();
        let columns_y: Vec<Vec<f64>> = self
            .pairs
            .iter()
            .map(|p| densify(n, &self.index, &p.y))
            .collect();
        (
            DMat::from_columns(&columns_x),
            DMat::from_columns(&columns_y),
        )
    }

    /// The most recent `count` source snapshots, dense.
    pub fn recent_snapshots(&self, count: usize) -> Vec<Vec<f64>> {
        let n = self.dim();
        self.pairs
            .iter()
            .rev()
            .take(count)
            .map(|p| densify(n, &self.index, &p.x))
            .collect()
    }
}

fn densify(n: usize, index: &HashMap<u64, usize>, sparse: &HashMap<u64, f64>) -> Vec<f64> {
    let mut dense = vec![0.0; n];
    for (concept, value) in sparse {
        if let Some(&row) = index.get(concept) {
            dense[row] = *value;
        }
    }
    dense
}

/// A mode straight out of a refresh, before merging into the mode set.
pub struct RawMode {
    pub eigenvalue: C64,
    /// Sparse coefficients over concept ids, already thresholded and capped.
    pub coefficients: Vec<(u64, f32)>,
    /// Normalized projection support of recent snapshots on this mode.
    pub support: f32,
}

/// Sparsification knobs for mode extraction.
pub struct ExtractionParams {
    pub rank: usize,
    pub l1_strength: f64,
    pub mag_floor: f64,
    pub sparsity_cap: usize,
    /// How many recent snapshots enter the support estimate.
    pub support_window: usize,
}

/// One full decomposition refresh over the buffer.
///
/// Returns one raw mode per retained eigenvalue (conjugate pairs are
/// represented by their upper-half-plane member). Numerical failure leaves
/// the caller's mode set untouched.
pub fn refresh(
    buffer: &SnapshotBuffer,
    params: &ExtractionParams,
) -> Result<Vec<RawMode>, NonConvergence> {
    if buffer.len() < 2 || buffer.dim() == 0 {
        return Ok(Vec::new());
    }
    let (x, y) = buffer.matrices();
    let svd = truncated_svd(&x, params.rank)?;
    let k = svd.sigma.len();
    if k == 0 {
        return Ok(Vec::new());
    }

    // Ã = Uᵀ Y V Σ⁻¹  (k × k).
    let ut = svd.u.transpose();
    let yv = y.matmul(&svd.v);
    let mut yvs = yv.clone();
    for c in 0..k {
        let inv = 1.0 / svd.sigma[c];
        for r in 0..yvs.rows() {
            yvs.set(r, c, yvs.get(r, c) * inv);
        }
    }
    let reduced = ut.matmul(&yvs);

    let eigs = eigenvalues(&reduced)?;
    let recent = buffer.recent_snapshots(params.support_window);

    let mut modes = Vec::new();
    for lambda in eigs {
        // One representative per conjugate pair; drop vanishing modes.
        if lambda.im < -1e-12 || lambda.abs() < 1e-9 {
            continue;
        }
        let w = eigenvector(&reduced, lambda);

        // Φ = Y V Σ⁻¹ w, evaluated through the already-scaled Y V Σ⁻¹.
        let n = yvs.rows();
        let mut phi: Vec<C64> = vec![C64::ZERO; n];
        for (col, wc) in w.iter().enumerate().take(k) {
            for (row, value) in phi.iter_mut().enumerate() {
                *value = *value + C64::real(yvs.get(row, col)) * *wc;
            }
        }

        // Real signed magnitude, unit-normalized before sparsification.
        let norm: f64 = phi.iter().map(|z| z.abs() * z.abs()).sum::<f64>().sqrt();
        if norm < 1e-12 {
            continue;
        }
        let mut coefficients: Vec<(u64, f32)> = Vec::new();
        for (row, z) in phi.iter().enumerate() {
            let magnitude = z.abs() / norm;
            let signed = if z.re >= 0.0 { magnitude } else { -magnitude };
            let shrunk = soft_threshold(signed, params.l1_strength);
            if shrunk.abs() >= params.mag_floor {
                coefficients.push((buffer.concept_at(row), shrunk as f32));
            }
        }
        if coefficients.is_empty() {
            continue;
        }
        if coefficients.len() > params.sparsity_cap {
            coefficients.sort_by(|a, b| {
                b.1.abs()
                    .partial_cmp(&a.1.abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            coefficients.truncate(params.sparsity_cap);
        }
        coefficients.sort_by_key(|(concept, _)| *concept);

        let support = support_of(&phi, norm, buffer, &recent);
        modes.push(RawMode {
            eigenvalue: lambda,
            coefficients,
            support,
        });
    }
    Ok(modes)
}

fn soft_threshold(value: f64, strength: f64) -> f64 {
    let shrunk = value.abs() - strength;
    if shrunk <= 0.0 {
        0.0
    } else {
        shrunk * value.signum()
    }
}

/// Normalized projection of recent snapshots onto the (unit) mode:
/// the mean of `|⟨x, φ⟩| / ‖x‖`, which Cauchy–Schwarz keeps in [0, 1].
fn support_of(
    phi: &[C64],
    phi_norm: f64,
    buffer: &SnapshotBuffer,
    recent: &[Vec<f64>],
) -> f32 {
    if recent.is_empty() || buffer.dim() == 0 {
        return 0.0;
    }
    let mut total = 0.0f64;
    let mut counted = 0usize;
    for snapshot in recent {
        let x_norm: f64 = snapshot.iter().map(|v| v * v).sum::<f64>().sqrt();
        if x_norm < 1e-12 {
            continue;
        }
        let mut dot = C64::ZERO;
        for (row, &value) in snapshot.iter().enumerate() {
            if value != 0.0 {
                dot = dot + phi[row].conj() * value;
            }
        }
        total += (dot.abs() / phi_norm / x_norm).min(1.0);
        counted += 1;
    }
    if counted == 0 {
        0.0
    } else {
        (total / counted as f64) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eid(n: u8) -> EpisodeId {
        EpisodeId([n; 16])
    }

    fn sparse(pairs: &[(u64, f64)]) -> HashMap<u64, f64> {
        pairs.iter().copied().collect()
    }

    fn params() -> ExtractionParams {
        ExtractionParams {
            rank: 10,
            l1_strength: 0.0,
            mag_floor: 1e-3,
            sparsity_cap: 64,
            support_window: 64,
        }
    }

    #[test]
    fn buffer_dedups_and_rolls() {
        let mut buffer = SnapshotBuffer::new(3);
        assert!(buffer.push((eid(1), 0), sparse(&[(1, 1.0)]), sparse(&[(1, 0.9)])));
        assert!(!buffer.push((eid(1), 0), sparse(&[(1, 1.0)]), sparse(&[(1, 0.9)])));
        for step in 1..=3u32 {
            buffer.push((eid(1), step), sparse(&[(1, 1.0)]), sparse(&[(1, 0.9)]));
        }
        assert_eq!(buffer.len(), 3);
        // The evicted key is admissible again.
        assert!(buffer.push((eid(1), 0), sparse(&[(1, 1.0)]), sparse(&[(1, 0.9)])));
    }

    #[test]
    fn identity_map_preserves_values() {
        let snapshot: HashMap<u64, f32> = [(3u64, 0.5f32)].into_iter().collect();
        let mapped = IdentityMap.apply(&snapshot);
        assert_eq!(mapped.get(&3).copied(), Some(0.5));
    }

    #[test]
    fn pure_decay_recovers_real_eigenvalue() {
        // x_{t+1} = 0.8 x_t along one concept direction.
        let mut buffer = SnapshotBuffer::new(64);
        let mut value = 1.0f64;
        for step in 0..20u32 {
            let next = value * 0.8;
            buffer.push(
                (eid(1), step),
                sparse(&[(7, value)]),
                sparse(&[(7, next)]),
            );
            value = next;
        }
        let modes = refresh(&buffer, &params()).unwrap();
        assert_eq!(modes.len(), 1);
        assert!((modes[0].eigenvalue.re - 0.8).abs() < 1e-6);
        assert!(modes[0].eigenvalue.im.abs() < 1e-6);
        assert_eq!(modes[0].coefficients.len(), 1);
        assert_eq!(modes[0].coefficients[0].0, 7);
        assert!(modes[0].support > 0.9);
    }

    #[test]
    fn rotating_trajectory_yields_complex_pair_member() {
        // Two coupled concepts rotating with |λ| = 0.95, angle π/8.
        let rho = 0.95f64;
        let theta = std::f64::consts::PI / 8.0;
        let (c, s) = (theta.cos(), theta.sin());
        let mut buffer = SnapshotBuffer::new(256);
        let (mut a, mut b) = (1.0f64, 0.0f64);
        for step in 0..100u32 {
            let na = rho * (c * a - s * b);
            let nb = rho * (s * a + c * b);
            buffer.push(
                (eid(2), step),
                sparse(&[(1, a), (2, b)]),
                sparse(&[(1, na), (2, nb)]),
            );
            a = na;
            b = nb;
        }
        let modes = refresh(&buffer, &params()).unwrap();
        assert!(!modes.is_empty());
        let lead = &modes[0];
        assert!((lead.eigenvalue.abs() - rho).abs() < 1e-6);
        assert!(lead.eigenvalue.im > 0.0);
        assert!((lead.eigenvalue.im - rho * s).abs() < 1e-6);
    }

    #[test]
    fn sparsity_cap_and_floor_bound_support() {
        let mut buffer = SnapshotBuffer::new(64);
        // Ten concepts decaying together.
        for step in 0..12u32 {
            let scale = 0.9f64.powi(step as i32);
            let x: HashMap<u64, f64> = (1..=10u64).map(|cpt| (cpt, scale)).collect();
            let y: HashMap<u64, f64> = (1..=10u64).map(|cpt| (cpt, scale * 0.9)).collect();
            buffer.push((eid(3), step), x, y);
        }
        let tight = ExtractionParams {
            sparsity_cap: 4,
            ..params()
        };
        let modes = refresh(&buffer, &tight).unwrap();
        assert_eq!(modes.len(), 1);
        assert!(modes[0].coefficients.len() <= 4);
    }

    #[test]
    fn empty_or_tiny_buffer_yields_no_modes() {
        let buffer = SnapshotBuffer::new(8);
        assert!(refresh(&buffer, &params()).unwrap().is_empty());
    }
}
