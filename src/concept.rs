//! Core concept types for the oneiros pipeline.
//!
//! Concepts are the nodes of the memory graph. Every episode references
//! concepts by [`ConceptId`], and the weight matrix couples pairs of them.
//! The [`ConceptTable`] is the flat process-wide registry; concepts are
//! created lazily on first reference and destroyed only by an explicit
//! orphan sweep, so ids stay stable for in-flight snapshots.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Unique, niche-optimized identifier for a concept.
///
/// Uses `NonZeroU64` so that `Option<ConceptId>` is the same size as
/// `ConceptId` (0 serves as the `None` discriminant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ConceptId(NonZeroU64);

impl ConceptId {
    /// Create a `ConceptId` from a raw `u64`. Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(ConceptId)
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for ConceptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c:{}", self.0)
    }
}

/// Metadata describing a concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptMeta {
    /// Unique identifier.
    pub id: ConceptId,
    /// Optional human-readable label.
    pub label: Option<String>,
    /// Count of non-zero entries in this concept's row of the weight matrix.
    pub degree: usize,
    /// When this concept was first referenced (seconds since UNIX epoch).
    pub created_at: u64,
}

/// Flat, concurrent registry of all concepts.
///
/// Two maps give O(1) lookups in both directions; the forward map is the
/// source of truth. Labels are normalized to lowercase for case-insensitive
/// matching, like any user-facing name lookup in the pipeline.
pub struct ConceptTable {
    /// Forward map: ConceptId → ConceptMeta (source of truth).
    id_to_meta: DashMap<ConceptId, ConceptMeta>,
    /// Reverse map: normalized label → ConceptId.
    label_to_id: DashMap<String, ConceptId>,
}

impl ConceptTable {
    /// Create a new empty table.
    pub fn new() -> Self {
        Self {
            id_to_meta: DashMap::new(),
            label_to_id: DashMap::new(),
        }
    }

    /// Ensure a concept exists for `id`, creating an unlabeled entry on first
    /// reference. Idempotent.
    pub fn ensure(&self, id: ConceptId) {
        self.id_to_meta.entry(id).or_insert_with(|| ConceptMeta {
            id,
            label: None,
            degree: 0,
            created_at: unix_now_secs(),
        });
    }

    /// Attach a label to a concept, creating the concept if needed.
    ///
    /// Returns `false` if the label is already taken by a different concept.
    pub fn label(&self, id: ConceptId, label: impl Into<String>) -> bool {
        let label = label.into();
        let normalized = label.to_lowercase();
        if let Some(existing) = self.label_to_id.get(&normalized) {
            if *existing.value() != id {
                return false;
            }
        }
        self.ensure(id);
        if let Some(mut meta) = self.id_to_meta.get_mut(&id) {
            meta.label = Some(label);
        }
        self.label_to_id.insert(normalized, id);
        true
    }

    /// Look up concept metadata by id.
    pub fn get(&self, id: ConceptId) -> Option<ConceptMeta> {
        self.id_to_meta.get(&id).map(|r| r.value().clone())
    }

    /// Look up a concept id by label (case-insensitive).
    pub fn lookup(&self, label: &str) -> Option<ConceptId> {
        self.label_to_id
            .get(&label.to_lowercase())
            .map(|r| *r.value())
    }

    /// Overwrite the cached degree for a concept (maintained by the weight
    /// matrix owner after each committed version).
    pub fn set_degree(&self, id: ConceptId, degree: usize) {
        self.ensure(id);
        if let Some(mut meta) = self.id_to_meta.get_mut(&id) {
            meta.degree = degree;
        }
    }

    /// Number of registered concepts.
    pub fn len(&self) -> usize {
        self.id_to_meta.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.id_to_meta.is_empty()
    }

    /// Remove concepts whose degree is zero and that are not referenced by
    /// `referenced`. Returns the ids removed.
    ///
    /// Called after prunes, never inline, so ids stay stable while readers
    /// hold weight snapshots.
    pub fn sweep_orphans<F>(&self, referenced: F) -> Vec<ConceptId>
    where
        F: Fn(ConceptId) -> bool,
    {
        let orphans: Vec<ConceptId> = self
            .id_to_meta
            .iter()
            .filter(|r| r.value().degree == 0 && !referenced(*r.key()))
            .map(|r| *r.key())
            .collect();
        for id in &orphans {
            if let Some((_, meta)) = self.id_to_meta.remove(id) {
                if let Some(label) = meta.label {
                    self.label_to_id.remove(&label.to_lowercase());
                }
            }
        }
        orphans
    }
}

impl Default for ConceptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe concept id allocator for callers that mint fresh concepts
/// (rather than referencing externally assigned ids).
pub struct AtomicConceptAllocator {
    next: AtomicU64,
}

impl AtomicConceptAllocator {
    /// Create an allocator starting at id 1 (0 is reserved as the niche).
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Create an allocator that resumes after `highest` (e.g. from a loaded
    /// checkpoint).
    pub fn resuming_after(highest: u64) -> Self {
        Self {
            next: AtomicU64::new(highest.saturating_add(1).max(1)),
        }
    }

    /// Allocate the next concept id.
    pub fn allocate(&self) -> ConceptId {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        // fetch_add starting from >= 1 cannot yield 0 before u64 wrap.
        ConceptId::new(raw).expect("concept id space exhausted")
    }
}

impl Default for AtomicConceptAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds since the UNIX epoch, saturating at 0 on a misset clock.
pub(crate) fn unix_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
