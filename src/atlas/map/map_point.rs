//! MapPoint - point landmark of the map store.
//!
//! A point knows which keyframe slots observe it. Its viewing normal and
//! distance bounds are derived from the observers' camera centres by
//! [`MapGraph`](super::MapGraph).

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::types::{KeyFrameId, MapPointId};

/// 256-bit ORB descriptor.
pub type OrbDescriptor = [u8; 32];

#[derive(Clone, Serialize, Deserialize)]
pub struct MapPoint {
    pub id: MapPointId,

    /// World position.
    pub position: Vector3<f64>,

    pub descriptor: OrbDescriptor,

    /// Observing keyframe → point slot in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean unit direction from the observers to the point.
    pub normal: Vector3<f64>,

    pub min_distance: f64,
    pub max_distance: f64,

    /// Keyframe the point was created from.
    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapPoint {
    pub fn new(id: MapPointId, position: Vector3<f64>, descriptor: OrbDescriptor, first_kf_id: KeyFrameId) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    /// Returns true if `kf_id` was an observer.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Recompute the normal and the scale-invariance distance bounds from
    /// the observers' camera centres.
    ///
    /// The observed distance range is widened by `scale_factor^(num_levels - 1)`
    /// on both ends.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centres: impl Iterator<Item = &'a Vector3<f64>>,
        scale_factor: f64,
        num_levels: u32,
    ) {
        let (normal, min_dist, max_dist) = viewing_geometry(&self.position, observer_centres);
        if let Some(normal) = normal {
            self.normal = normal;
        }
        let scale_range = scale_factor.powi(num_levels as i32 - 1);
        self.min_distance = min_dist / scale_range;
        self.max_distance = max_dist * scale_range;
    }
}

/// Mean unit viewing direction and min/max distance of `target` seen from
/// the given camera centres.
pub(crate) fn viewing_geometry<'a>(
    target: &Vector3<f64>,
    centres: impl Iterator<Item = &'a Vector3<f64>>,
) -> (Option<Vector3<f64>>, f64, f64) {
    let mut normal_sum = Vector3::zeros();
    let mut min_dist = f64::INFINITY;
    let mut max_dist = 0.0f64;

    for centre in centres {
        let dir = target - centre;
        let dist = dir.norm();
        if dist > 1e-10 {
            normal_sum += dir / dist;
            min_dist = min_dist.min(dist);
            max_dist = max_dist.max(dist);
        }
    }

    let norm = normal_sum.norm();
    let normal = (norm > 1e-10).then(|| normal_sum / norm);
    (normal, min_dist, max_dist)
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.observations.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_add_remove_observation() {
        let mut mp = MapPoint::new(MapPointId::new(1), Vector3::new(1.0, 2.0, 3.0), [0u8; 32], KeyFrameId::new(0));

        mp.add_observation(KeyFrameId::new(1), 5);
        mp.add_observation(KeyFrameId::new(2), 10);
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observations.get(&KeyFrameId::new(1)), Some(&5));

        assert!(mp.erase_observation(KeyFrameId::new(1)));
        assert!(!mp.erase_observation(KeyFrameId::new(1)));
        assert_eq!(mp.num_observations(), 1);
    }

    #[test]
    fn test_update_normal_and_depth() {
        let mut mp = MapPoint::new(MapPointId::new(3), Vector3::new(0.0, 0.0, 4.0), [0u8; 32], KeyFrameId::new(0));
        let centres = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 2.0)];
        mp.update_normal_and_depth(centres.iter(), 1.2, 2);

        assert_relative_eq!(mp.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(mp.min_distance, 2.0 / 1.2, epsilon = 1e-12);
        assert_relative_eq!(mp.max_distance, 4.0 * 1.2, epsilon = 1e-12);
    }

    #[test]
    fn test_viewing_geometry_ignores_coincident_centre() {
        let target = Vector3::new(1.0, 0.0, 0.0);
        let centres = [target, Vector3::zeros()];
        let (normal, min_dist, max_dist) = viewing_geometry(&target, centres.iter());

        assert_relative_eq!(normal.unwrap(), Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(min_dist, 1.0);
        assert_relative_eq!(max_dist, 1.0);
        assert!(viewing_geometry(&target, [target].iter()).0.is_none());
    }
}
