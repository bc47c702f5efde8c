//! The annealed wake–sleep cycle math.
//!
//! Pure functions over an edge map working copy: sign quantization, Gibbs
//! reconstruction at a temperature, the clipped Hebbian update, and batch
//! energy. The scheduler drives these through the annealing schedule and
//! owns all state-machine and persistence concerns.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::concept::ConceptId;
use crate::episode::Episode;

/// Edge map working copy: canonical `(min, max)` keys, like the committed
/// matrix.
pub type EdgeMap = BTreeMap<(u64, u64), f32>;

/// A batch episode prepared for the cycle: its concepts, its raw
/// activations, and the evolving chain state.
pub struct CyclePattern {
    /// Concept ids in episode order (deduplicated).
    pub concepts: Vec<u64>,
    /// Sign-quantized wake state `x⁺`.
    pub positive: Vec<f32>,
    /// Chain state for the negative phase; starts at the raw activations.
    pub chain: Vec<f32>,
    /// Sign-quantized states traversed, for `activation.trace`.
    pub trajectory: Vec<Vec<f32>>,
}

impl CyclePattern {
    /// Prepare an episode: dedup concepts (keeping first occurrence) and
    /// seed the chain from the raw activations.
    pub fn from_episode(episode: &Episode) -> Self {
        let mut concepts = Vec::with_capacity(episode.concept_ids.len());
        let mut chain = Vec::with_capacity(episode.concept_ids.len());
        let mut seen = std::collections::HashSet::new();
        for (cid, &a) in episode
            .concept_ids
            .iter()
            .zip(episode.activation_vector.iter())
        {
            if seen.insert(cid.get()) {
                concepts.push(cid.get());
                chain.push(a);
            }
        }
        let positive = sign_quantize(&chain);
        let trajectory = vec![positive.clone()];
        Self {
            concepts,
            positive,
            chain,
            trajectory,
        }
    }

    /// Sparse pattern map for energy evaluation.
    pub fn quantized_pattern(&self) -> HashMap<u64, f32> {
        self.concepts
            .iter()
            .copied()
            .zip(self.positive.iter().copied())
            .collect()
    }

    /// Concept ids as typed ids (for event payloads).
    pub fn concept_ids(&self) -> Vec<ConceptId> {
        self.concepts
            .iter()
            .filter_map(|&raw| ConceptId::new(raw))
            .collect()
    }
}

/// Quantize to `{−1, +1}`; zero maps to `+1`.
pub fn sign_quantize(x: &[f32]) -> Vec<f32> {
    x.iter().map(|&v| if v >= 0.0 { 1.0 } else { -1.0 }).collect()
}

/// Weight of an edge in the working copy.
#[inline]
fn edge(edges: &EdgeMap, a: u64, b: u64) -> f32 {
    if a == b {
        return 0.0;
    }
    let key = if a <= b { (a, b) } else { (b, a) };
    edges.get(&key).copied().unwrap_or(0.0)
}

/// Mean bilinear energy `−½ xᵀWx` of the quantized patterns under `edges`.
pub fn mean_energy(edges: &EdgeMap, patterns: &[CyclePattern]) -> f64 {
    if patterns.is_empty() {
        return 0.0;
    }
    let total: f64 = patterns
        .par_iter()
        .map(|p| {
            let lookup: HashMap<u64, f32> = p.quantized_pattern();
            let mut sum = 0.0f64;
            for ((i, j), w) in edges {
                let (Some(xi), Some(xj)) = (lookup.get(i), lookup.get(j)) else {
                    continue;
                };
                sum += f64::from(*w) * f64::from(*xi) * f64::from(*xj);
            }
            -sum
        })
        .sum();
    total / patterns.len() as f64
}

/// One negative-phase reconstruction: `sweeps` Gibbs passes over the
/// pattern's units at temperature `temp`, restricted to the couplings among
/// the episode's own concepts. Mutates the chain in place and returns the
/// sign-quantized reconstruction.
pub fn gibbs_reconstruct(
    edges: &EdgeMap,
    pattern: &mut CyclePattern,
    temp: f64,
    sweeps: u32,
    rng: &mut StdRng,
) -> Vec<f32> {
    let n = pattern.concepts.len();
    for _ in 0..sweeps {
        for i in 0..n {
            let ci = pattern.concepts[i];
            let mut field = 0.0f64;
            for j in 0..n {
                if i == j {
                    continue;
                }
                let w = edge(edges, ci, pattern.concepts[j]);
                if w != 0.0 {
                    field += f64::from(w) * f64::from(pattern.chain[j]);
                }
            }
            // P(x_i = +1) = σ(2h_i / T).
            let p_up = 1.0 / (1.0 + (-2.0 * field / temp.max(1e-9)).exp());
            pattern.chain[i] = if rng.gen_range(0.0..1.0) < p_up { 1.0 } else { -1.0 };
        }
    }
    sign_quantize(&pattern.chain)
}

/// Apply the clipped Hebbian contrastive update:
/// `W ← clip(W + η · (mean x⁺x⁺ᵀ − mean x⁻x⁻ᵀ))` with a zero diagonal.
///
/// Outer products only couple concepts that co-occur within an episode, so
/// the edge growth per cycle is bounded by the batch's co-occurrence
/// structure.
pub fn hebbian_update(
    edges: &mut EdgeMap,
    batch: &[(Vec<u64>, Vec<f32>, Vec<f32>)],
    eta: f64,
    clip: f32,
) {
    if batch.is_empty() {
        return;
    }
    let scale = eta / batch.len() as f64;
    let mut deltas: HashMap<(u64, u64), f64> = HashMap::new();
    for (concepts, positive, negative) in batch {
        let n = concepts.len();
        for i in 0..n {
            for j in (i + 1)..n {
                let (a, b) = (concepts[i], concepts[j]);
                if a == b {
                    continue;
                }
                let key = if a <= b { (a, b) } else { (b, a) };
                let plus = f64::from(positive[i]) * f64::from(positive[j]);
                let minus = f64::from(negative[i]) * f64::from(negative[j]);
                *deltas.entry(key).or_default() += scale * (plus - minus);
            }
        }
    }
    for (key, delta) in deltas {
        if delta == 0.0 {
            continue;
        }
        let next = (f64::from(edge(edges, key.0, key.1)) + delta) as f32;
        let clipped = next.clamp(-clip, clip);
        if clipped == 0.0 {
            edges.remove(&key);
        } else {
            edges.insert(key, clipped);
        }
    }
}

/// Deterministic per-episode RNG: the cycle seed mixed with the episode's
/// batch position, so rayon scheduling cannot perturb a replay.
pub fn episode_rng(cycle_seed: u64, index: usize) -> StdRng {
    StdRng::seed_from_u64(cycle_seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Run one annealing iteration over the whole batch at temperature `temp`:
/// reconstruct every pattern (in parallel, deterministically seeded), apply
/// the update, and extend each trajectory with the reconstruction.
pub fn anneal_iteration(
    edges: &mut EdgeMap,
    patterns: &mut [CyclePattern],
    temp: f64,
    sweeps: u32,
    eta: f64,
    clip: f32,
    cycle_seed: u64,
    iteration: u32,
) {
    let iter_seed = cycle_seed.wrapping_add(u64::from(iteration).wrapping_mul(0xA24B_AED4_963E_E407));
    let frozen = edges.clone();
    let reconstructions: Vec<Vec<f32>> = patterns
        .par_iter_mut()
        .enumerate()
        .map(|(idx, pattern)| {
            let mut rng = episode_rng(iter_seed, idx);
            gibbs_reconstruct(&frozen, pattern, temp, sweeps, &mut rng)
        })
        .collect();

    let batch: Vec<(Vec<u64>, Vec<f32>, Vec<f32>)> = patterns
        .iter()
        .zip(reconstructions.iter())
        .map(|(p, neg)| (p.concepts.clone(), p.positive.clone(), neg.clone()))
        .collect();
    hebbian_update(edges, &batch, eta, clip);

    for (pattern, neg) in patterns.iter_mut().zip(reconstructions) {
        pattern.trajectory.push(neg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Meta;

    fn episode(concepts: &[u64], activations: &[f32]) -> Episode {
        Episode::new(
            1,
            concepts
                .iter()
                .map(|&c| ConceptId::new(c).unwrap())
                .collect(),
            activations.to_vec(),
            Meta::new(),
        )
        .unwrap()
    }

    #[test]
    fn sign_quantize_maps_zero_up() {
        assert_eq!(sign_quantize(&[0.3, -0.7, 0.0]), vec![1.0, -1.0, 1.0]);
    }

    #[test]
    fn pattern_dedups_concepts() {
        let ep = episode(&[1, 2, 1, 3], &[0.5, -0.5, 0.9, 0.1]);
        let p = CyclePattern::from_episode(&ep);
        assert_eq!(p.concepts, vec![1, 2, 3]);
        assert_eq!(p.positive, vec![1.0, -1.0, 1.0]);
        assert_eq!(p.trajectory.len(), 1);
    }

    #[test]
    fn hebbian_update_strengthens_coactive_pairs() {
        let mut edges = EdgeMap::new();
        // Positive phase has 1 and 2 aligned; the reconstruction opposes them.
        let batch = vec![(
            vec![1u64, 2u64],
            vec![1.0f32, 1.0],
            vec![1.0f32, -1.0],
        )];
        hebbian_update(&mut edges, &batch, 0.1, 1.0);
        // Δ = η(1·1 − 1·(−1)) = 0.2.
        let w = edges.get(&(1, 2)).copied().unwrap();
        assert!((w - 0.2).abs() < 1e-6);
    }

    #[test]
    fn hebbian_update_clips() {
        let mut edges = EdgeMap::new();
        edges.insert((1, 2), 0.95);
        let batch = vec![(vec![1u64, 2u64], vec![1.0f32, 1.0], vec![-1.0f32, 1.0])];
        hebbian_update(&mut edges, &batch, 1.0, 1.0);
        assert_eq!(edges.get(&(1, 2)).copied().unwrap(), 1.0);
    }

    #[test]
    fn gibbs_at_low_temperature_follows_the_field() {
        // Strong positive coupling: units should align.
        let mut edges = EdgeMap::new();
        edges.insert((1, 2), 1.0);
        let ep = episode(&[1, 2], &[1.0, -1.0]);
        let mut pattern = CyclePattern::from_episode(&ep);
        pattern.chain = vec![1.0, 1.0];
        let mut rng = episode_rng(7, 0);
        let rec = gibbs_reconstruct(&edges, &mut pattern, 0.01, 5, &mut rng);
        assert_eq!(rec[0], rec[1]);
    }

    #[test]
    fn anneal_iteration_is_deterministic_for_a_seed() {
        let ep1 = episode(&[1, 2, 3], &[1.0, 1.0, -1.0]);
        let ep2 = episode(&[2, 3, 4], &[-1.0, 1.0, 1.0]);

        let run = |seed: u64| {
            let mut edges = EdgeMap::new();
            let mut patterns: Vec<CyclePattern> = [&ep1, &ep2]
                .iter()
                .map(|e| CyclePattern::from_episode(e))
                .collect();
            for k in 1..=3u32 {
                anneal_iteration(&mut edges, &mut patterns, 2.0 * 0.9f64.powi(k as i32), 3, 0.05, 1.0, seed, k);
            }
            edges
        };

        assert_eq!(run(11), run(11));
        // Energies and trajectories exist even when a different seed happens
        // to reach the same fixed point, so only assert replay equality.
    }

    #[test]
    fn mean_energy_decreases_when_couplings_match_patterns() {
        let ep = episode(&[1, 2], &[1.0, 1.0]);
        let patterns = vec![CyclePattern::from_episode(&ep)];
        let mut edges = EdgeMap::new();
        assert_eq!(mean_energy(&edges, &patterns), 0.0);
        edges.insert((1, 2), 0.5);
        assert!(mean_energy(&edges, &patterns) < 0.0);
    }
}
