//! In-memory exhaustive vector index.
//!
//! The index content is an immutable [`IndexSnapshot`]. Rebuilding creates a
//! new snapshot and swaps the shared pointer; a reader that cloned the
//! previous `Arc` keeps searching the old content until it drops it, so a
//! search never observes a half-built index.
//!
//! Search is a linear scan of inner products. All vectors are unit length,
//! so the inner product is the cosine similarity. Exact search over tens of
//! thousands of entries is fast enough that an approximate index would only
//! cost precision.

use crate::types::KnowledgeEntry;
use chrono::{DateTime, Utc};
use kbqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Entry payload stored next to each vector, so query answers do not need a
/// round trip to the knowledge store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub entry_id: i64,
    pub category: String,
    pub question: String,
    pub answer: String,
}

impl From<&KnowledgeEntry> for IndexedEntry {
    fn from(entry: &KnowledgeEntry) -> Self {
        Self {
            entry_id: entry.id,
            category: entry.category.clone(),
            question: entry.question.clone(),
            answer: entry.answer.clone(),
        }
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SearchHit {
    /// Position of the vector in the snapshot, in insertion order
    pub slot: usize,
    pub entry_id: i64,
    /// Raw inner product in [-1, 1]
    pub score: f32,
}

/// Immutable index content.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    dimensions: usize,
    entries: Vec<IndexedEntry>,
    /// Row-major `entries.len() x dimensions`
    vectors: Vec<f32>,
    built_at: DateTime<Utc>,
    source_watermark: Option<DateTime<Utc>>,
    fingerprint: String,
    /// Embedder and normalizer that produced the vectors
    embedding_space: String,
}

impl IndexSnapshot {
    /// Build a snapshot from `(entry, vector)` pairs in slot order.
    ///
    /// Fails with `DimensionMismatch` on the first vector whose length is
    /// not `dimensions`, and with `InvalidInput` when an entry id appears
    /// twice.
    pub fn build(
        dimensions: usize,
        slots: Vec<(IndexedEntry, Vec<f32>)>,
        source_watermark: Option<DateTime<Utc>>,
        fingerprint: String,
    ) -> AppResult<Self> {
        Self::restore(dimensions, slots, Utc::now(), source_watermark, fingerprint)
    }

    /// Like [`IndexSnapshot::build`] with an explicit build time, for
    /// snapshots read back from disk.
    pub fn restore(
        dimensions: usize,
        slots: Vec<(IndexedEntry, Vec<f32>)>,
        built_at: DateTime<Utc>,
        source_watermark: Option<DateTime<Utc>>,
        fingerprint: String,
    ) -> AppResult<Self> {
        let mut entries = Vec::with_capacity(slots.len());
        let mut vectors = Vec::with_capacity(slots.len() * dimensions);
        let mut seen = HashSet::with_capacity(slots.len());

        for (entry, vector) in slots {
            if vector.len() != dimensions {
                return Err(AppError::DimensionMismatch {
                    expected: dimensions,
                    actual: vector.len(),
                });
            }
            if !seen.insert(entry.entry_id) {
                return Err(AppError::InvalidInput(format!(
                    "Entry {} appears twice in the index",
                    entry.entry_id
                )));
            }
            entries.push(entry);
            vectors.extend_from_slice(&vector);
        }

        Ok(Self {
            dimensions,
            entries,
            vectors,
            built_at,
            source_watermark,
            fingerprint,
            embedding_space: String::new(),
        })
    }

    /// Tag the snapshot with the embedding space its vectors live in.
    pub fn with_embedding_space(mut self, space: impl Into<String>) -> Self {
        self.embedding_space = space.into();
        self
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexedEntry] {
        &self.entries
    }

    pub fn entry(&self, slot: usize) -> Option<&IndexedEntry> {
        self.entries.get(slot)
    }

    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        let start = slot.checked_mul(self.dimensions)?;
        self.vectors.get(start..start + self.dimensions)
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Store modification time observed when the snapshot was built.
    pub fn source_watermark(&self) -> Option<DateTime<Utc>> {
        self.source_watermark
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Empty for snapshots that predate space tagging.
    pub fn embedding_space(&self) -> &str {
        &self.embedding_space
    }

    /// Top-`k` slots by descending inner product with `query`.
    ///
    /// Equal scores keep insertion order. An empty snapshot yields an empty
    /// list.
    pub fn search(&self, query: &[f32], k: usize) -> AppResult<Vec<SearchHit>> {
        if query.len() != self.dimensions {
            return Err(AppError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .vectors
            .chunks_exact(self.dimensions)
            .zip(&self.entries)
            .enumerate()
            .map(|(slot, (vector, entry))| SearchHit {
                slot,
                entry_id: entry.entry_id,
                score: dot(query, vector),
            })
            .collect();

        // sort_by is stable
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// SHA-256 over entry ids and modification times, in the given order.
pub fn fingerprint(entries: &[KnowledgeEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.id.to_le_bytes());
        hasher.update(entry.modified_at.timestamp_micros().to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Shared handle to the current snapshot.
#[derive(Debug)]
pub struct VectorIndex {
    dimensions: usize,
    current: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl VectorIndex {
    /// An index with no snapshot loaded.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            current: RwLock::new(None),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// The current snapshot, if one has been installed.
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Number of indexed entries; zero when nothing is loaded.
    pub fn len(&self) -> usize {
        self.snapshot().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole content with `slots`.
    ///
    /// The new snapshot is built before the swap; on error the previous
    /// content stays in place.
    pub fn rebuild(
        &self,
        slots: Vec<(IndexedEntry, Vec<f32>)>,
        source_watermark: Option<DateTime<Utc>>,
        fingerprint: String,
    ) -> AppResult<Arc<IndexSnapshot>> {
        let snapshot = IndexSnapshot::build(self.dimensions, slots, source_watermark, fingerprint)?;
        self.install(snapshot)
    }

    /// Swap in a prebuilt snapshot.
    pub fn install(&self, snapshot: IndexSnapshot) -> AppResult<Arc<IndexSnapshot>> {
        if snapshot.dimensions() != self.dimensions {
            return Err(AppError::DimensionMismatch {
                expected: self.dimensions,
                actual: snapshot.dimensions(),
            });
        }

        let snapshot = Arc::new(snapshot);
        let previous = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(Arc::clone(&snapshot));

        tracing::debug!(
            entries = snapshot.len(),
            previous_entries = previous.map(|p| p.len()).unwrap_or(0),
            "Installed index snapshot"
        );
        Ok(snapshot)
    }

    /// Search the current snapshot.
    pub fn search(&self, query: &[f32], k: usize) -> AppResult<Vec<SearchHit>> {
        if query.len() != self.dimensions {
            return Err(AppError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.len(),
            });
        }
        match self.snapshot() {
            Some(snapshot) => snapshot.search(query, k),
            None => Ok(Vec::new()),
        }
    }
}
