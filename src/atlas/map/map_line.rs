//! MapLine - A 3D line landmark observed by KeyFrames.
//!
//! Line landmarks follow the same bookkeeping as [`MapPoint`](super::MapPoint):
//! observations per keyframe and a lazy `is_bad` flag. Geometry is a finite
//! 3D segment given by its two endpoints.

use std::collections::HashMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::map_point::viewing_geometry;
use super::types::{KeyFrameId, MapLineId};

/// 256-bit LBD line descriptor.
pub type LineDescriptor = [u8; 32];

#[derive(Clone, Serialize, Deserialize)]
pub struct MapLine {
    pub id: MapLineId,

    /// Segment start point in world frame.
    pub start: Vector3<f64>,

    /// Segment end point in world frame.
    pub end: Vector3<f64>,

    pub descriptor: LineDescriptor,

    /// KeyFrames observing this line, mapped to line feature index.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Mean viewing direction of the segment midpoint.
    pub normal: Vector3<f64>,

    pub min_distance: f64,
    pub max_distance: f64,

    pub first_kf_id: KeyFrameId,

    pub is_bad: bool,
}

impl MapLine {
    pub fn new(
        id: MapLineId,
        start: Vector3<f64>,
        end: Vector3<f64>,
        descriptor: LineDescriptor,
        first_kf_id: KeyFrameId,
    ) -> Self {
        Self {
            id,
            start,
            end,
            descriptor,
            observations: HashMap::new(),
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            first_kf_id,
            is_bad: false,
        }
    }

    pub fn midpoint(&self) -> Vector3<f64> {
        (self.start + self.end) * 0.5
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.insert(kf_id, feature_idx);
    }

    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        self.observations.remove(&kf_id).is_some()
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }

    /// Same as [`MapPoint::update_normal_and_depth`](super::MapPoint::update_normal_and_depth),
    /// measured at the segment midpoint.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        kf_positions: impl Iterator<Item = &'a Vector3<f64>>,
        scale_factor: f64,
        num_levels: u32,
    ) {
        let (normal, min_dist, max_dist) = viewing_geometry(&self.midpoint(), kf_positions);
        if let Some(normal) = normal {
            self.normal = normal;
        }
        let scale_range = scale_factor.powi(num_levels as i32 - 1);
        self.min_distance = min_dist / scale_range;
        self.max_distance = max_dist * scale_range;
    }
}

impl std::fmt::Debug for MapLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapLine")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("observations", &self.observations.len())
            .field("is_bad", &self.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn create_test_mapline() -> MapLine {
        MapLine::new(
            MapLineId::new(4),
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(2.0, 0.0, 5.0),
            [0u8; 32],
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_observations() {
        let mut ml = create_test_mapline();
        ml.add_observation(KeyFrameId::new(1), 3);
        ml.add_observation(KeyFrameId::new(2), 0);
        assert_eq!(ml.num_observations(), 2);
        assert!(ml.erase_observation(KeyFrameId::new(1)));
        assert!(!ml.erase_observation(KeyFrameId::new(1)));
        assert_eq!(ml.observations.get(&KeyFrameId::new(2)), Some(&0));
    }

    #[test]
    fn test_normal_uses_midpoint() {
        let mut ml = create_test_mapline();
        let centres = [Vector3::new(1.0, 0.0, 0.0)];
        ml.update_normal_and_depth(centres.iter(), 1.2, 1);
        assert_relative_eq!(ml.midpoint(), Vector3::new(1.0, 0.0, 5.0));
        assert_relative_eq!(ml.normal, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        assert_relative_eq!(ml.min_distance, 5.0, epsilon = 1e-12);
    }
}
