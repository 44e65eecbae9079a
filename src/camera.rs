//! Pinhole camera model referenced by keyframes.
//!
//! Calibration itself is out of scope; the map only needs to know which
//! camera each keyframe was taken with so the atlas can persist every model
//! once and re-link keyframes on load.

use serde::{Deserialize, Serialize};

use crate::atlas::map::CameraId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub id: CameraId,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline in meters (0 for monocular).
    pub baseline: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraModel {
    pub fn pinhole(id: CameraId, fx: f64, fy: f64, cx: f64, cy: f64, width: u32, height: u32) -> Self {
        Self {
            id,
            fx,
            fy,
            cx,
            cy,
            baseline: 0.0,
            width,
            height,
        }
    }

    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the optical centre.
    pub fn project(&self, p_cam: &nalgebra::Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let u = self.fx * p_cam.x / p_cam.z + self.cx;
        let v = self.fy * p_cam.y / p_cam.z + self.cy;
        Some((u, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn test_project_principal_point() {
        let cam = CameraModel::pinhole(CameraId::new(0), 450.0, 450.0, 320.0, 240.0, 640, 480);
        let (u, v) = cam.project(&Vector3::new(0.0, 0.0, 2.0)).unwrap();
        assert_eq!((u, v), (320.0, 240.0));
        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }
}
