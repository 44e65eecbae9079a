//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Pose estimate (SE3 transform) and velocity
//! - Point and line landmark associations per feature slot
//! - Graph relationships (covisibility, spanning tree, loop edges)
//!
//! The covisibility graph connects KeyFrames that share landmark observations,
//! while the spanning tree and loop edges form the essential graph that must
//! keep every live keyframe connected to the map origin.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::atlas::keyframe_db::BowVector;
use crate::geometry::SE3;

use super::map_point::OrbDescriptor;
use super::types::{CameraId, KeyFrameId, MapLineId, MapPointId};

/// A KeyFrame in the SLAM map.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyFrame {
    /// Unique identifier for this KeyFrame.
    pub id: KeyFrameId,

    /// Timestamp in nanoseconds.
    pub timestamp_ns: u64,

    /// Pose: transform from camera to world (T_wc).
    /// To transform a point from camera to world: p_world = pose.transform_point(p_cam)
    pub pose: SE3,

    /// Velocity in world frame (m/s).
    pub velocity: Vector3<f64>,

    /// Camera model this keyframe was captured with.
    pub camera_id: Option<CameraId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    /// ORB descriptors of the point features, kept so the BoW vector can be
    /// recomputed after a load.
    pub descriptors: Vec<OrbDescriptor>,

    /// Optional Bag-of-Words representation used for place recognition.
    pub bow_vector: Option<BowVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// Point feature index → MapPoint association.
    pub map_point_ids: Vec<Option<MapPointId>>,

    /// Line feature index → MapLine association.
    pub map_line_ids: Vec<Option<MapLineId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Temporal Links (for IMU)
    // ─────────────────────────────────────────────────────────────────────────
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Covisibility weights: connected KeyFrame → number of shared landmarks.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Cached ordered list of covisible KeyFrames (best first).
    #[serde(skip)]
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    #[serde(skip)]
    covisibility_dirty: bool,

    // ─────────────────────────────────────────────────────────────────────────
    // Essential Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Parent KeyFrame in the spanning tree.
    /// None for the root KeyFrame (typically the first in the map).
    pub parent_id: Option<KeyFrameId>,

    /// Children KeyFrames in the spanning tree.
    pub children_ids: HashSet<KeyFrameId>,

    /// KeyFrames connected through an accepted loop closure.
    pub loop_edges: HashSet<KeyFrameId>,

    /// Whether this KeyFrame is marked as bad (to be removed).
    pub is_bad: bool,
}

impl KeyFrame {
    /// Create a new KeyFrame with `num_points` point slots and `num_lines`
    /// line slots.
    pub fn new(
        id: KeyFrameId,
        timestamp_ns: u64,
        pose: SE3,
        num_points: usize,
        num_lines: usize,
    ) -> Self {
        Self {
            id,
            timestamp_ns,
            pose,
            velocity: Vector3::zeros(),
            camera_id: None,
            descriptors: Vec::new(),
            bow_vector: None,
            map_point_ids: vec![None; num_points],
            map_line_ids: vec![None; num_lines],
            prev_kf: None,
            next_kf: None,
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent_id: None,
            children_ids: HashSet::new(),
            loop_edges: HashSet::new(),
            is_bad: false,
        }
    }

    /// Get the camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.translation
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Associate a point feature with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    pub fn get_map_line(&self, feature_idx: usize) -> Option<MapLineId> {
        self.map_line_ids.get(feature_idx).copied().flatten()
    }

    pub fn set_map_line(&mut self, feature_idx: usize, ml_id: MapLineId) -> Option<MapLineId> {
        let slot = self.map_line_ids.get_mut(feature_idx)?;
        slot.replace(ml_id)
    }

    pub fn erase_map_line(&mut self, feature_idx: usize) -> Option<MapLineId> {
        self.map_line_ids.get_mut(feature_idx)?.take()
    }

    pub fn num_map_lines(&self) -> usize {
        self.map_line_ids.iter().filter(|ml| ml.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    pub fn add_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return; // Don't connect to self
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    /// Update the covisibility weight for an existing connection.
    pub fn update_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if let Some(w) = self.covisibility_weights.get_mut(&kf_id) {
            *w = weight;
            self.covisibility_dirty = true;
        }
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn get_covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// Get the N best covisible KeyFrames (most shared landmarks first).
    pub fn get_best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered_covisibles();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Rebuild the ordered covisibles list if dirty.
    ///
    /// The cache is not persisted, so a length mismatch after a load also
    /// triggers a rebuild.
    fn ensure_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty && self.ordered_covisibles.len() == self.covisibility_weights.len() {
            return;
        }

        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Weight descending, id ascending on ties for a stable order.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loop Edges
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        if kf_id != self.id {
            self.loop_edges.insert(kf_id);
        }
    }

    /// Every keyframe this one is linked to through the covisibility graph,
    /// the spanning tree or a loop edge.
    pub fn essential_neighbours(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.covisibility_weights
            .keys()
            .copied()
            .chain(self.parent_id)
            .chain(self.children_ids.iter().copied())
            .chain(self.loop_edges.iter().copied())
    }

    /// Drop every reference that the predicates reject.
    ///
    /// Returns the number of references removed. Used when the set of live
    /// entities is only known at save or load time.
    pub fn retain_references(
        &mut self,
        keep_kf: impl Fn(KeyFrameId) -> bool,
        keep_mp: impl Fn(MapPointId) -> bool,
        keep_ml: impl Fn(MapLineId) -> bool,
    ) -> usize {
        let mut dropped = 0;

        for slot in self.map_point_ids.iter_mut() {
            if slot.is_some_and(|id| !keep_mp(id)) {
                *slot = None;
                dropped += 1;
            }
        }
        for slot in self.map_line_ids.iter_mut() {
            if slot.is_some_and(|id| !keep_ml(id)) {
                *slot = None;
                dropped += 1;
            }
        }

        let before = self.covisibility_weights.len();
        self.covisibility_weights.retain(|id, _| keep_kf(*id));
        if self.covisibility_weights.len() != before {
            self.covisibility_dirty = true;
            dropped += before - self.covisibility_weights.len();
        }

        let before = self.children_ids.len() + self.loop_edges.len();
        self.children_ids.retain(|id| keep_kf(*id));
        self.loop_edges.retain(|id| keep_kf(*id));
        dropped += before - self.children_ids.len() - self.loop_edges.len();

        for link in [&mut self.parent_id, &mut self.prev_kf, &mut self.next_kf] {
            if link.is_some_and(|id| !keep_kf(id)) {
                *link = None;
                dropped += 1;
            }
        }

        dropped
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("timestamp_ns", &self.timestamp_ns)
            .field("num_map_points", &self.num_map_points())
            .field("num_map_lines", &self.num_map_lines())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_keyframe(id: u64) -> KeyFrame {
        KeyFrame::new(KeyFrameId::new(id), 1000000 * id, SE3::identity(), 10, 5)
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_test_keyframe(1);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        // Overwrite association
        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        let erased = kf.erase_map_point(3);
        assert_eq!(erased, Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);

        // Out of range slots are ignored
        assert_eq!(kf.set_map_point(50, MapPointId::new(1)), None);
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_map_line_association() {
        let mut kf = create_test_keyframe(1);
        kf.set_map_line(0, MapLineId::new(9));
        kf.set_map_line(4, MapLineId::new(10));
        assert_eq!(kf.num_map_lines(), 2);
        assert_eq!(kf.get_map_line(4), Some(MapLineId::new(10)));
        assert_eq!(kf.erase_map_line(0), Some(MapLineId::new(9)));
        assert_eq!(kf.num_map_lines(), 1);
    }

    #[test]
    fn test_covisibility_graph() {
        let mut kf = create_test_keyframe(1);

        kf.add_covisibility(KeyFrameId::new(2), 50);
        kf.add_covisibility(KeyFrameId::new(3), 100);
        kf.add_covisibility(KeyFrameId::new(4), 25);

        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(5)), 0);

        let best = kf.get_best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);

        // The ordered cache follows later updates
        kf.update_covisibility(KeyFrameId::new(4), 200);
        assert_eq!(kf.get_best_covisibles(1), vec![KeyFrameId::new(4)]);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let mut kf = create_test_keyframe(1);
        kf.add_covisibility(KeyFrameId::new(1), 100);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_essential_neighbours() {
        let mut kf = create_test_keyframe(2);
        kf.set_parent(KeyFrameId::new(1));
        kf.add_child(KeyFrameId::new(3));
        kf.add_loop_edge(KeyFrameId::new(9));
        kf.add_covisibility(KeyFrameId::new(4), 12);

        let mut neighbours: Vec<_> = kf.essential_neighbours().collect();
        neighbours.sort();
        assert_eq!(
            neighbours,
            vec![
                KeyFrameId::new(1),
                KeyFrameId::new(3),
                KeyFrameId::new(4),
                KeyFrameId::new(9)
            ]
        );
    }

    #[test]
    fn test_retain_references() {
        let mut kf = create_test_keyframe(2);
        kf.set_parent(KeyFrameId::new(1));
        kf.add_covisibility(KeyFrameId::new(3), 4);
        kf.set_map_point(0, MapPointId::new(7));
        kf.set_map_point(1, MapPointId::new(8));

        let dropped = kf.retain_references(
            |id| id != KeyFrameId::new(1),
            |id| id == MapPointId::new(7),
            |_| true,
        );

        assert_eq!(dropped, 2);
        assert_eq!(kf.parent_id, None);
        assert_eq!(kf.get_map_point(0), Some(MapPointId::new(7)));
        assert_eq!(kf.get_map_point(1), None);
        assert_eq!(kf.get_covisibility_weight(KeyFrameId::new(3)), 4);
    }
}
