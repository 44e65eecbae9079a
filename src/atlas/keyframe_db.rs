//! KeyFrameDatabase - lightweight place recognition index.
//!
//! Keyframes are indexed by their Bag-of-Words vector. The vocabulary that
//! produces those vectors is supplied from outside through [`Vocabulary`];
//! the database only stores and scores them.

use std::collections::HashMap;

use crate::atlas::map::{KeyFrameId, MapId, OrbDescriptor};

/// Bag-of-Words vector: word_id -> weight.
pub type BowVector = HashMap<u32, f64>;

/// Converts a keyframe's descriptors into a BoW vector.
pub trait Vocabulary: Send + Sync {
    fn transform(&self, descriptors: &[OrbDescriptor]) -> BowVector;
}

/// Candidate keyframe with similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub map_id: MapId,
    pub score: f64,
}

/// KeyFrame database shared by every map of an atlas.
#[derive(Debug, Default)]
pub struct KeyFrameDatabase {
    /// For each keyframe, its BoW vector and owning map.
    entries: HashMap<KeyFrameId, (BowVector, MapId)>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a keyframe entry.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: BowVector, map_id: MapId) {
        self.entries.insert(kf_id, (bow, map_id));
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        self.entries.remove(&kf_id);
    }

    /// Drop every entry belonging to `map_id`.
    pub fn clear_map(&mut self, map_id: MapId) {
        self.entries.retain(|_, (_, owner)| *owner != map_id);
    }

    /// Re-tag entries after a map id change.
    pub fn rename_map(&mut self, from: MapId, to: MapId) {
        for (_, owner) in self.entries.values_mut() {
            if *owner == from {
                *owner = to;
            }
        }
    }

    pub fn contains(&self, kf_id: KeyFrameId) -> bool {
        self.entries.contains_key(&kf_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Detect candidate keyframes similar to the provided BoW vector.
    ///
    /// Scoring is a sparse dot product. Results are sorted by decreasing
    /// score.
    pub fn detect_candidates(
        &self,
        query: &BowVector,
        exclude_map: Option<MapId>,
        max_results: usize,
    ) -> Vec<Candidate> {
        let mut cands = Vec::new();

        for (kf_id, (bow, map_id)) in &self.entries {
            if exclude_map == Some(*map_id) {
                continue;
            }

            let score: f64 = query
                .iter()
                .filter_map(|(word_id, weight)| bow.get(word_id).map(|w| weight * w))
                .sum();

            if score > 0.0 {
                cands.push(Candidate {
                    keyframe_id: *kf_id,
                    map_id: *map_id,
                    score,
                });
            }
        }

        cands.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.keyframe_id.cmp(&b.keyframe_id)));
        cands.truncate(max_results);
        cands
    }
}
