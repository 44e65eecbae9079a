//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Used for whole-map corrections: gravity alignment after IMU
//! initialisation and metric scale refinement. With `scale == 1.0` this
//! reduces to an [`SE3`].

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

use super::SE3;

/// Similarity transform. Transforms points as `p' = s * R * p + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from rotation matrix, translation, and scale.
    pub fn from_rts(rotation: &Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = nalgebra::Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Drop the scale component.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// `S^{-1} = [(1/s)R^T | -(1/s)R^T*t]`
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation) * scale_inv,
            scale: scale_inv,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Apply the similarity to a camera-to-world pose.
    ///
    /// The camera centre is moved like any world point while the orientation
    /// only picks up the rotation, so the result stays a rigid pose:
    /// `R' = R_yw * R_wc`, `t' = s * R_yw * t_wc + t_yw`.
    pub fn transform_pose(&self, t_wc: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * t_wc.rotation,
            translation: self.transform_point(&t_wc.translation),
        }
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn is_se3(&self, tolerance: f64) -> bool {
        (self.scale - 1.0).abs() < tolerance
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}
