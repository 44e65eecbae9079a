//! Gaussian image pyramid and per-level scale table.

use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;

use crate::error::ExtractionError;

/// Per-level scale metadata.
///
/// Level 0 is the input resolution: scale factor 1 and sigma² 1. Level `i`
/// has scale factor `s^i` and sigma² equal to the square of that factor.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleLevels {
    pub scale_factors: Vec<f32>,
    pub inv_scale_factors: Vec<f32>,
    pub level_sigma2: Vec<f32>,
    pub inv_level_sigma2: Vec<f32>,
}

impl ScaleLevels {
    pub fn new(scale_factor: f32, num_levels: usize) -> Self {
        let factors = (0..num_levels).map(|i| scale_factor.powi(i as i32)).collect();
        Self::from_factors(factors)
    }

    /// Derive the inverse and sigma tables from explicit level factors.
    pub fn from_factors(scale_factors: Vec<f32>) -> Self {
        let inv_scale_factors = scale_factors.iter().map(|s| 1.0 / s).collect();
        let level_sigma2: Vec<f32> = scale_factors
            .iter()
            .enumerate()
            .map(|(i, s)| if i == 0 { 1.0 } else { s * s })
            .collect();
        let inv_level_sigma2 = level_sigma2.iter().map(|s2| 1.0 / s2).collect();
        Self {
            scale_factors,
            inv_scale_factors,
            level_sigma2,
            inv_level_sigma2,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.scale_factors.len()
    }
}

/// Image pyramid produced during detection.
pub struct Pyramid {
    pub images: Vec<Mat>,
    pub scales: ScaleLevels,
}

impl Pyramid {
    /// Blur and downsample `image` by `scale_factor` per level.
    pub fn build(image: &Mat, scale_factor: f32, num_levels: usize) -> Result<Self, ExtractionError> {
        if num_levels == 0 || scale_factor < 1.0 {
            return Err(ExtractionError::InvalidConfig(format!(
                "pyramid needs at least one level and a scale factor >= 1 (got {num_levels} levels, factor {scale_factor})"
            )));
        }
        let scales = ScaleLevels::new(scale_factor, num_levels);

        let mut images = Vec::with_capacity(num_levels);
        images.push(image.try_clone()?);
        for level in 1..num_levels {
            let inv = scales.inv_scale_factors[level];
            let size = Size::new(
                ((image.cols() as f32 * inv).round() as i32).max(1),
                ((image.rows() as f32 * inv).round() as i32).max(1),
            );

            let mut blurred = Mat::default();
            imgproc::gaussian_blur_def(&images[level - 1], &mut blurred, Size::new(5, 5), 1.0)?;
            let mut down = Mat::default();
            imgproc::resize(&blurred, &mut down, size, 0.0, 0.0, imgproc::INTER_LINEAR)?;
            images.push(down);
        }

        Ok(Self { images, scales })
    }

    pub fn num_levels(&self) -> usize {
        self.images.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use opencv::core::{CV_8UC1, Scalar};

    #[test]
    fn test_scale_levels() {
        let levels = ScaleLevels::new(1.2, 4);

        assert_eq!(levels.num_levels(), 4);
        assert_relative_eq!(levels.scale_factors[0], 1.0);
        assert_relative_eq!(levels.scale_factors[3], 1.728, epsilon = 1e-5);
        assert_relative_eq!(levels.level_sigma2[0], 1.0);
        for i in 0..4 {
            assert_relative_eq!(levels.scale_factors[i] * levels.inv_scale_factors[i], 1.0, epsilon = 1e-6);
            assert_relative_eq!(levels.level_sigma2[i] * levels.inv_level_sigma2[i], 1.0, epsilon = 1e-6);
        }
        assert_relative_eq!(levels.level_sigma2[2], 1.44 * 1.44, epsilon = 1e-5);
    }

    #[test]
    fn test_pyramid_sizes() {
        let image = Mat::new_rows_cols_with_default(120, 160, CV_8UC1, Scalar::all(128.0)).unwrap();
        let pyramid = Pyramid::build(&image, 2.0, 3).unwrap();

        assert_eq!(pyramid.num_levels(), 3);
        assert_eq!(pyramid.images[1].cols(), 80);
        assert_eq!(pyramid.images[2].rows(), 30);
    }

    #[test]
    fn test_pyramid_rejects_bad_params() {
        let image = Mat::new_rows_cols_with_default(10, 10, CV_8UC1, Scalar::all(0.0)).unwrap();
        assert!(Pyramid::build(&image, 1.2, 0).is_err());
        assert!(Pyramid::build(&image, 0.5, 3).is_err());
    }
}
