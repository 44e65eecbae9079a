//! MapGraph - single-threaded arena behind the map-update lock.
//!
//! The graph owns every KeyFrame, MapPoint and MapLine of one map, keyed by
//! id. All relationships are stored as ids:
//! - KeyFrames observe landmarks (KF → MP/ML via feature slots)
//! - Landmarks track their observers (MP/ML → KF via `observations`)
//! - KeyFrames link to each other through covisibility, the spanning tree
//!   and loop edges (the essential graph)
//!
//! [`Map`](super::Map) wraps this type in a lock; nothing here synchronizes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use nalgebra::Vector3;

use crate::error::MapError;
use crate::geometry::Sim3;

use super::keyframe::KeyFrame;
use super::map_line::MapLine;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapLineId, MapPointId};

/// Structural state of one map.
pub struct MapGraph {
    pub(super) keyframes: HashMap<KeyFrameId, KeyFrame>,
    pub(super) map_points: HashMap<MapPointId, MapPoint>,
    pub(super) map_lines: HashMap<MapLineId, MapLine>,

    /// Local-mapping working sets, replaced wholesale.
    pub(super) reference_map_points: Vec<MapPointId>,
    pub(super) reference_map_lines: Vec<MapLineId>,

    /// Keyframes that anchor the essential graph.
    pub(super) keyframe_origins: Vec<KeyFrameId>,
    /// First keyframe ever added.
    pub(super) initial_kf: Option<KeyFrameId>,
    /// Keyframe with the lowest id ever added.
    pub(super) lower_kf: Option<KeyFrameId>,
    pub(super) first_region_kf: Option<KeyFrameId>,
    /// Tail of the temporal chain.
    pub(super) last_keyframe_id: Option<KeyFrameId>,

    pub(super) init_kf_id: u64,
    pub(super) max_kf_id: u64,
    pub(super) last_loop_kf_id: u64,

    /// Index related to a big change in the map (loop closure, global BA).
    pub(super) big_change_index: u64,

    pub(super) imu_initialized: bool,
    pub(super) is_inertial: bool,
    pub(super) inertial_ba1: bool,
    pub(super) inertial_ba2: bool,

    /// Pyramid scale factor used for landmark distance bounds.
    pub(super) scale_factor: f64,
    pub(super) num_levels: u32,
}

impl MapGraph {
    pub fn new(init_kf_id: u64, scale_factor: f64, num_levels: u32) -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            map_lines: HashMap::new(),
            reference_map_points: Vec::new(),
            reference_map_lines: Vec::new(),
            keyframe_origins: Vec::new(),
            initial_kf: None,
            lower_kf: None,
            first_region_kf: None,
            last_keyframe_id: None,
            init_kf_id,
            max_kf_id: init_kf_id,
            last_loop_kf_id: 0,
            big_change_index: 0,
            imu_initialized: false,
            is_inertial: false,
            inertial_ba1: false,
            inertial_ba2: false,
            scale_factor,
            num_levels,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a keyframe. Returns false (and leaves the map untouched) if a
    /// keyframe with the same id is already present.
    pub fn add_keyframe(&mut self, kf: KeyFrame) -> bool {
        if self.keyframes.contains_key(&kf.id) {
            return false;
        }
        let id = kf.id;

        if self.keyframes.is_empty() && self.initial_kf.is_none() {
            self.init_kf_id = id.0;
            self.initial_kf = Some(id);
            self.lower_kf = Some(id);
            if self.keyframe_origins.is_empty() {
                self.keyframe_origins.push(id);
            }
        }

        self.max_kf_id = self.max_kf_id.max(id.0);
        if self.lower_kf.is_none_or(|lower| id < lower) {
            self.lower_kf = Some(id);
        }

        self.keyframes.insert(id, kf);
        true
    }

    /// Insert a freshly created keyframe and link it to the temporal chain.
    ///
    /// Unlike [`add_keyframe`](Self::add_keyframe), an id that is already in
    /// use is an integrity error.
    pub fn insert_new_keyframe(&mut self, mut kf: KeyFrame) -> Result<KeyFrameId, MapError> {
        let id = kf.id;
        if self.keyframes.contains_key(&id) {
            return Err(MapError::DuplicateId {
                kind: "keyframe",
                id: id.0,
            });
        }

        if let Some(prev_id) = self.last_keyframe_id {
            if let Some(prev_kf) = self.keyframes.get_mut(&prev_id) {
                kf.prev_kf = Some(prev_id);
                prev_kf.next_kf = Some(id);
            }
        }

        self.add_keyframe(kf);
        self.last_keyframe_id = Some(id);
        Ok(id)
    }

    /// Remove a keyframe from the arena.
    ///
    /// References held by other entities are left for the caller to clean
    /// up. Remembered origin, initial and lowest ids are kept. An origin
    /// keyframe is only marked bad and stays in the arena as a backbone node.
    ///
    /// Returns false if there was nothing to remove or retire.
    pub fn erase_keyframe(&mut self, id: KeyFrameId) -> bool {
        if self.is_origin(id) {
            return match self.keyframes.get_mut(&id) {
                Some(kf) if !kf.is_bad => {
                    kf.set_bad();
                    true
                }
                _ => false,
            };
        }

        let Some(removed) = self.keyframes.remove(&id) else {
            return false;
        };
        if self.last_keyframe_id == Some(id) {
            self.last_keyframe_id = removed.prev_kf;
        }
        true
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframe_ids(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.keyframes.keys().copied()
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Landmark Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_map_point(&mut self, mp: MapPoint) -> bool {
        if self.map_points.contains_key(&mp.id) {
            return false;
        }
        self.map_points.insert(mp.id, mp);
        true
    }

    pub fn insert_new_map_point(&mut self, mp: MapPoint) -> Result<MapPointId, MapError> {
        let id = mp.id;
        if !self.add_map_point(mp) {
            return Err(MapError::DuplicateId {
                kind: "map point",
                id: id.0,
            });
        }
        Ok(id)
    }

    pub fn erase_map_point(&mut self, id: MapPointId) -> Option<MapPoint> {
        self.map_points.remove(&id)
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    pub fn add_map_line(&mut self, ml: MapLine) -> bool {
        if self.map_lines.contains_key(&ml.id) {
            return false;
        }
        self.map_lines.insert(ml.id, ml);
        true
    }

    pub fn insert_new_map_line(&mut self, ml: MapLine) -> Result<MapLineId, MapError> {
        let id = ml.id;
        if !self.add_map_line(ml) {
            return Err(MapError::DuplicateId {
                kind: "map line",
                id: id.0,
            });
        }
        Ok(id)
    }

    pub fn erase_map_line(&mut self, id: MapLineId) -> Option<MapLine> {
        self.map_lines.remove(&id)
    }

    pub fn map_line(&self, id: MapLineId) -> Option<&MapLine> {
        self.map_lines.get(&id)
    }

    pub fn map_line_mut(&mut self, id: MapLineId) -> Option<&mut MapLine> {
        self.map_lines.get_mut(&id)
    }

    pub fn num_map_lines(&self) -> usize {
        self.map_lines.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ landmark)
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame point feature
    /// and a MapPoint, and bump covisibility with the point's other observers.
    ///
    /// Returns false if either side is missing or the slot is out of range.
    pub fn associate_point(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return false;
        };
        let existing_observers: Vec<KeyFrameId> = mp.observations.keys().copied().collect();

        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.map_point_ids.len() {
            return false;
        }
        kf.set_map_point(feature_idx, mp_id);

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }

        self.increase_covisibility(kf_id, &existing_observers);
        true
    }

    /// Line counterpart of [`associate_point`](Self::associate_point).
    pub fn associate_line(&mut self, kf_id: KeyFrameId, feature_idx: usize, ml_id: MapLineId) -> bool {
        let Some(ml) = self.map_lines.get(&ml_id) else {
            return false;
        };
        let existing_observers: Vec<KeyFrameId> = ml.observations.keys().copied().collect();

        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.map_line_ids.len() {
            return false;
        }
        kf.set_map_line(feature_idx, ml_id);

        if let Some(ml) = self.map_lines.get_mut(&ml_id) {
            ml.add_observation(kf_id, feature_idx);
        }

        self.increase_covisibility(kf_id, &existing_observers);
        true
    }

    /// Remove the association between a KeyFrame point feature and its MapPoint.
    ///
    /// Returns the MapPoint ID that was disassociated, if any.
    pub fn disassociate_point(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get_mut(&kf_id)?.erase_map_point(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = match self.map_points.get_mut(&mp_id) {
            Some(mp) => {
                mp.erase_observation(kf_id);
                mp.observations.keys().copied().collect()
            }
            None => Vec::new(),
        };

        self.decrease_covisibility(kf_id, &other_observers);
        Some(mp_id)
    }

    pub fn disassociate_line(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapLineId> {
        let ml_id = self.keyframes.get_mut(&kf_id)?.erase_map_line(feature_idx)?;

        let other_observers: Vec<KeyFrameId> = match self.map_lines.get_mut(&ml_id) {
            Some(ml) => {
                ml.erase_observation(kf_id);
                ml.observations.keys().copied().collect()
            }
            None => Vec::new(),
        };

        self.decrease_covisibility(kf_id, &other_observers);
        Some(ml_id)
    }

    fn increase_covisibility(&mut self, kf_id: KeyFrameId, observers: &[KeyFrameId]) {
        for &other_kf_id in observers {
            if other_kf_id == kf_id {
                continue;
            }
            let new_weight = self
                .keyframes
                .get(&other_kf_id)
                .map_or(0, |kf| kf.get_covisibility_weight(kf_id))
                + 1;

            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.add_covisibility(other_kf_id, new_weight);
            }
            if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                other_kf.add_covisibility(kf_id, new_weight);
            }
        }
    }

    fn decrease_covisibility(&mut self, kf_id: KeyFrameId, observers: &[KeyFrameId]) {
        for &other_kf_id in observers {
            if other_kf_id == kf_id {
                continue;
            }
            let current_weight = self
                .keyframes
                .get(&other_kf_id)
                .map_or(0, |kf| kf.get_covisibility_weight(kf_id));

            if current_weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_kf_id);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.erase_covisibility(kf_id);
                }
            } else {
                let new_weight = current_weight - 1;
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.update_covisibility(other_kf_id, new_weight);
                }
                if let Some(other_kf) = self.keyframes.get_mut(&other_kf_id) {
                    other_kf.update_covisibility(kf_id, new_weight);
                }
            }
        }
    }

    /// Attach `child` under `parent` in the spanning tree, detaching it from
    /// any previous parent.
    pub fn set_spanning_parent(&mut self, child: KeyFrameId, parent: KeyFrameId) -> bool {
        if child == parent || !self.keyframes.contains_key(&parent) {
            return false;
        }
        let Some(old_parent) = self.keyframes.get(&child).map(|kf| kf.parent_id) else {
            return false;
        };
        if let Some(old) = old_parent.and_then(|id| self.keyframes.get_mut(&id)) {
            old.erase_child(child);
        }
        if let Some(kf) = self.keyframes.get_mut(&child) {
            kf.set_parent(parent);
        }
        if let Some(kf) = self.keyframes.get_mut(&parent) {
            kf.add_child(child);
        }
        true
    }

    /// Record a loop closure between two keyframes (both directions).
    pub fn add_loop_edge(&mut self, a: KeyFrameId, b: KeyFrameId) -> bool {
        if a == b || !self.keyframes.contains_key(&a) || !self.keyframes.contains_key(&b) {
            return false;
        }
        if let Some(kf) = self.keyframes.get_mut(&a) {
            kf.add_loop_edge(b);
        }
        if let Some(kf) = self.keyframes.get_mut(&b) {
            kf.add_loop_edge(a);
        }
        true
    }

    /// Get the N keyframes sharing the most landmarks with `kf_id`.
    pub fn local_keyframes(&mut self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        self.keyframes
            .get_mut(&kf_id)
            .map(|kf| kf.get_best_covisibles(n))
            .unwrap_or_default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    fn observer_centres(&self, observers: impl Iterator<Item = KeyFrameId>) -> Vec<Vector3<f64>> {
        observers
            .filter_map(|id| self.keyframes.get(&id).map(|kf| kf.camera_center()))
            .collect()
    }

    /// Update the normal and depth bounds for a MapPoint.
    pub fn update_map_point_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let centres = self.observer_centres(mp.observations.keys().copied());
        let (scale_factor, num_levels) = (self.scale_factor, self.num_levels);
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.update_normal_and_depth(centres.iter(), scale_factor, num_levels);
        }
    }

    pub fn update_map_line_normal_and_depth(&mut self, ml_id: MapLineId) {
        let Some(ml) = self.map_lines.get(&ml_id) else {
            return;
        };
        let centres = self.observer_centres(ml.observations.keys().copied());
        let (scale_factor, num_levels) = (self.scale_factor, self.num_levels);
        if let Some(ml) = self.map_lines.get_mut(&ml_id) {
            ml.update_normal_and_depth(centres.iter(), scale_factor, num_levels);
        }
    }

    /// Apply a similarity transform to every pose and landmark in place.
    ///
    /// Keyframe velocities are rotated, and additionally scaled when
    /// `scale_velocity` is set. Landmark normals and depth bounds are
    /// recomputed against the moved keyframes.
    pub fn apply_similarity(&mut self, correction: &Sim3, scale_velocity: bool) {
        let velocity_gain = if scale_velocity { correction.scale } else { 1.0 };

        for kf in self.keyframes.values_mut() {
            kf.pose = correction.transform_pose(&kf.pose);
            kf.velocity = correction.rotation * kf.velocity * velocity_gain;
        }
        for mp in self.map_points.values_mut() {
            mp.position = correction.transform_point(&mp.position);
        }
        for ml in self.map_lines.values_mut() {
            ml.start = correction.transform_point(&ml.start);
            ml.end = correction.transform_point(&ml.end);
        }

        let point_ids: Vec<MapPointId> = self.map_points.keys().copied().collect();
        for id in point_ids {
            self.update_map_point_normal_and_depth(id);
        }
        let line_ids: Vec<MapLineId> = self.map_lines.keys().copied().collect();
        for id in line_ids {
            self.update_map_line_normal_and_depth(id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Essential Graph
    // ─────────────────────────────────────────────────────────────────────────

    fn is_origin(&self, id: KeyFrameId) -> bool {
        self.keyframe_origins.contains(&id)
    }

    /// Keyframes usable as graph nodes: live ones plus origins, which stay
    /// part of the backbone even once marked bad.
    fn is_backbone_node(&self, kf: &KeyFrame) -> bool {
        !kf.is_bad || self.is_origin(kf.id)
    }

    /// Breadth-first walk from every present origin over covisibility,
    /// spanning tree and loop edges.
    fn reachable_from_origins(&self) -> HashSet<KeyFrameId> {
        let mut visited: HashSet<KeyFrameId> = HashSet::new();
        let mut queue: VecDeque<KeyFrameId> = self
            .keyframe_origins
            .iter()
            .copied()
            .filter(|id| self.keyframes.contains_key(id))
            .collect();
        visited.extend(queue.iter().copied());

        while let Some(id) = queue.pop_front() {
            let Some(kf) = self.keyframes.get(&id) else {
                continue;
            };
            for next in kf.essential_neighbours() {
                if visited.contains(&next) {
                    continue;
                }
                if let Some(next_kf) = self.keyframes.get(&next) {
                    if self.is_backbone_node(next_kf) {
                        visited.insert(next);
                        queue.push_back(next);
                    }
                }
            }
        }
        visited
    }

    /// Verify that every live keyframe can reach an origin keyframe.
    pub fn check_essential_graph(&self) -> Result<(), MapError> {
        let has_live = self.keyframes.values().any(|kf| !kf.is_bad);
        if !has_live {
            return Ok(());
        }
        if !self
            .keyframe_origins
            .iter()
            .any(|id| self.keyframes.contains_key(id))
        {
            return Err(MapError::MissingOrigin);
        }

        let reachable = self.reachable_from_origins();
        let mut disconnected: Vec<KeyFrameId> = self
            .keyframes
            .values()
            .filter(|kf| !kf.is_bad && !reachable.contains(&kf.id))
            .map(|kf| kf.id)
            .collect();

        if disconnected.is_empty() {
            Ok(())
        } else {
            disconnected.sort();
            Err(MapError::DisconnectedKeyFrames {
                keyframes: disconnected,
            })
        }
    }

    /// Human-readable dump of the spanning tree under each origin, followed
    /// by any live keyframe the walk did not reach.
    pub fn essential_graph_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "essential graph: {} keyframes, origins {:?}",
            self.keyframes.len(),
            self.keyframe_origins
        );

        let mut printed: HashSet<KeyFrameId> = HashSet::new();
        for &origin in &self.keyframe_origins {
            let mut stack = vec![(origin, 0usize)];
            while let Some((id, depth)) = stack.pop() {
                if !printed.insert(id) {
                    continue;
                }
                let Some(kf) = self.keyframes.get(&id) else {
                    let _ = writeln!(out, "{:indent$}{id} (erased)", "", indent = depth * 2);
                    continue;
                };
                let mut loops: Vec<_> = kf.loop_edges.iter().copied().collect();
                loops.sort();
                let _ = writeln!(
                    out,
                    "{:indent$}{id}{} covisibles={} loops={:?}",
                    "",
                    if kf.is_bad { " [bad]" } else { "" },
                    kf.covisibility_weights().len(),
                    loops,
                    indent = depth * 2
                );
                let mut children: Vec<_> = kf.children_ids.iter().copied().collect();
                children.sort_by(|a, b| b.cmp(a));
                stack.extend(children.into_iter().map(|child| (child, depth + 1)));
            }
        }

        let reachable = self.reachable_from_origins();
        let mut orphans: Vec<_> = self
            .keyframes
            .values()
            .filter(|kf| !kf.is_bad && !reachable.contains(&kf.id))
            .map(|kf| kf.id)
            .collect();
        orphans.sort();
        for id in orphans {
            let _ = writeln!(out, "disconnected: {id}");
        }
        out
    }

    /// Clear the entire map. The initial keyframe id and the pyramid
    /// parameters are kept; `max_kf_id` falls back to the initial id.
    ///
    /// `big_change_index` and the inertial sensor latch never go back, so
    /// both carry over.
    pub fn clear(&mut self) {
        let (big_change_index, is_inertial) = (self.big_change_index, self.is_inertial);
        *self = Self::new(self.init_kf_id, self.scale_factor, self.num_levels);
        self.big_change_index = big_change_index;
        self.is_inertial = is_inertial;
    }
}

impl std::fmt::Debug for MapGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapGraph")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("num_map_lines", &self.map_lines.len())
            .field("max_kf_id", &self.max_kf_id)
            .field("big_change_index", &self.big_change_index)
            .finish()
    }
}
