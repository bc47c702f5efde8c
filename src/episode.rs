//! Episode records: immutable, content-addressed activation snapshots.
//!
//! An [`Episode`] captures the concept activations observed at one point in
//! time. Its [`EpisodeId`] is a deterministic 128-bit digest of the capture
//! time, the activation vector, the referenced concepts, and the metadata,
//! so re-ingesting the same snapshot always yields the same id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::concept::ConceptId;
use crate::error::VaultError;

/// Maximum number of metadata entries per episode.
pub const MAX_META_ENTRIES: usize = 64;
/// Maximum total bytes across all metadata keys and values.
pub const MAX_META_BYTES: usize = 8 * 1024;

/// Opaque 128-bit content address of an episode.
///
/// Rendered as 32 lowercase hex digits. Derived by truncating a SHA-256
/// digest; the full digest is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EpisodeId(pub [u8; 16]);

impl EpisodeId {
    /// Parse an id from its 32-digit hex rendering.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(EpisodeId(bytes))
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// An immutable snapshot of concept activations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    /// Content address over `(created_at, concept_ids, activation_vector, meta)`.
    pub id: EpisodeId,
    /// Capture time in monotonic nanoseconds.
    pub created_at: u64,
    /// Concepts active at capture, in capture order.
    pub concept_ids: Vec<ConceptId>,
    /// Dense activations, one per entry of `concept_ids`, each in [-1, 1].
    pub activation_vector: Vec<f32>,
    /// Bounded string metadata.
    pub meta: BTreeMap<String, String>,
}

impl Episode {
    /// Build and validate an episode, computing its content address.
    pub fn new(
        created_at: u64,
        concept_ids: Vec<ConceptId>,
        activation_vector: Vec<f32>,
        meta: BTreeMap<String, String>,
    ) -> Result<Self, VaultError> {
        validate_activations(&activation_vector)?;
        validate_meta(&meta)?;
        let id = content_address(created_at, &concept_ids, &activation_vector, &meta);
        Ok(Self {
            id,
            created_at,
            concept_ids,
            activation_vector,
            meta,
        })
    }

    /// Recompute the content address from the episode's fields.
    ///
    /// For any episode returned by the vault, `rehash() == id`.
    pub fn rehash(&self) -> EpisodeId {
        content_address(
            self.created_at,
            &self.concept_ids,
            &self.activation_vector,
            &self.meta,
        )
    }
}

/// Deterministic 128-bit content address.
///
/// The digest covers every field in a fixed serialization order; f32
/// activations are hashed by their IEEE-754 bit patterns so the address is
/// exact, not tolerance-based.
fn content_address(
    created_at: u64,
    concept_ids: &[ConceptId],
    activations: &[f32],
    meta: &BTreeMap<String, String>,
) -> EpisodeId {
    let mut hasher = Sha256::new();
    hasher.update(created_at.to_le_bytes());
    hasher.update((concept_ids.len() as u64).to_le_bytes());
    for id in concept_ids {
        hasher.update(id.get().to_le_bytes());
    }
    hasher.update((activations.len() as u64).to_le_bytes());
    for a in activations {
        hasher.update(a.to_bits().to_le_bytes());
    }
    hasher.update((meta.len() as u64).to_le_bytes());
    for (k, v) in meta {
        hasher.update((k.len() as u64).to_le_bytes());
        hasher.update(k.as_bytes());
        hasher.update((v.len() as u64).to_le_bytes());
        hasher.update(v.as_bytes());
    }
    let digest = hasher.finalize();
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    EpisodeId(id)
}

fn validate_activations(activations: &[f32]) -> Result<(), VaultError> {
    for (index, &value) in activations.iter().enumerate() {
        if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
            return Err(VaultError::ActivationRange { index, value });
        }
    }
    Ok(())
}

fn validate_meta(meta: &BTreeMap<String, String>) -> Result<(), VaultError> {
    let bytes: usize = meta.iter().map(|(k, v)| k.len() + v.len()).sum();
    if meta.len() > MAX_META_ENTRIES || bytes > MAX_META_BYTES {
        return Err(VaultError::MetaTooLarge {
            entries: meta.len(),
            bytes,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(raw: u64) -> ConceptId {
        ConceptId::new(raw).unwrap()
    }

    fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn content_address_is_deterministic() {
        let a = Episode::new(
            42,
            vec![cid(1), cid(2)],
            vec![0.5, -0.5],
            meta(&[("src", "test")]),
        )
        .unwrap();
        let b = Episode::new(
            42,
            vec![cid(1), cid(2)],
            vec![0.5, -0.5],
            meta(&[("src", "test")]),
        )
        .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.rehash(), a.id);
    }

    #[test]
    fn content_address_is_sensitive_to_every_field() {
        let base = Episode::new(42, vec![cid(1)], vec![0.5], meta(&[])).unwrap();
        let time = Episode::new(43, vec![cid(1)], vec![0.5], meta(&[])).unwrap();
        let concept = Episode::new(42, vec![cid(2)], vec![0.5], meta(&[])).unwrap();
        let act = Episode::new(42, vec![cid(1)], vec![0.25], meta(&[])).unwrap();
        let tagged = Episode::new(42, vec![cid(1)], vec![0.5], meta(&[("k", "v")])).unwrap();
        assert_ne!(base.id, time.id);
        assert_ne!(base.id, concept.id);
        assert_ne!(base.id, act.id);
        assert_ne!(base.id, tagged.id);
    }

    #[test]
    fn id_hex_round_trip() {
        let ep = Episode::new(1, vec![cid(9)], vec![1.0], meta(&[])).unwrap();
        let rendered = ep.id.to_string();
        assert_eq!(rendered.len(), 32);
        assert_eq!(EpisodeId::parse(&rendered), Some(ep.id));
        assert_eq!(EpisodeId::parse("zz"), None);
    }

    #[test]
    fn rejects_out_of_range_activation() {
        let err = Episode::new(1, vec![cid(1)], vec![1.5], meta(&[])).unwrap_err();
        assert!(matches!(err, VaultError::ActivationRange { index: 0, .. }));
        let err = Episode::new(1, vec![cid(1)], vec![f32::NAN], meta(&[])).unwrap_err();
        assert!(matches!(err, VaultError::ActivationRange { .. }));
    }

    #[test]
    fn rejects_oversized_meta() {
        let mut m = BTreeMap::new();
        for i in 0..(MAX_META_ENTRIES + 1) {
            m.insert(format!("k{i}"), "v".to_string());
        }
        let err = Episode::new(1, vec![], vec![], m).unwrap_err();
        assert!(matches!(err, VaultError::MetaTooLarge { .. }));
    }
}
