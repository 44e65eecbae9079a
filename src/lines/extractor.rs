//! Line extraction pipeline.
//!
//! Per image:
//! 1. detect keylines over a Gaussian pyramid with the configured backend
//! 2. drop lines whose midpoint falls outside the region of interest
//! 3. drop lines touching a dynamic object (see [`DynamicFilter`])
//! 4. keep the strongest `n_features` lines and renumber them
//! 5. compute LBD descriptors for the final list

use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::atlas::map::LineDescriptor;
use crate::error::ExtractionError;

use super::backend::{DetectionParams, EdBackend, LineBackend, LsdBackend, LsdParams};
use super::dynamic::{DynamicConfig, DynamicFilter, InstanceMasks};
use super::keyline::{KeyLine, descriptor_row};
use super::pyramid::ScaleLevels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Lsd,
    Ed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineExtractorConfig {
    pub detector: DetectorKind,
    /// Maximum number of lines kept per image. 0 keeps every line.
    pub n_features: usize,
    pub num_levels: usize,
    pub scale_factor: f32,
    /// Minimum line length as a fraction of the shorter image side.
    pub min_line_length_ratio: f32,
    pub lsd: LsdParams,
    pub dynamic: DynamicConfig,
}

impl Default for LineExtractorConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Lsd,
            n_features: 200,
            num_levels: 8,
            scale_factor: 1.2,
            min_line_length_ratio: 0.025,
            lsd: LsdParams::default(),
            dynamic: DynamicConfig::default(),
        }
    }
}

impl LineExtractorConfig {
    pub fn validate(&self) -> Result<(), ExtractionError> {
        if self.num_levels == 0 {
            return Err(ExtractionError::InvalidConfig("num_levels must be at least 1".into()));
        }
        if self.scale_factor < 1.0 {
            return Err(ExtractionError::InvalidConfig(format!(
                "scale_factor must be >= 1, got {}",
                self.scale_factor
            )));
        }
        if !(0.0..1.0).contains(&self.min_line_length_ratio) {
            return Err(ExtractionError::InvalidConfig(format!(
                "min_line_length_ratio must be in [0, 1), got {}",
                self.min_line_length_ratio
            )));
        }
        Ok(())
    }
}

/// Output of one extraction call.
pub struct LineFeatures {
    pub lines: Vec<KeyLine>,
    /// One LBD row per line, same order as `lines`.
    pub descriptors: Mat,
    pub scales: ScaleLevels,
    /// Gaussian pyramid the lines were detected on.
    pub pyramid: Vec<Mat>,
}

impl LineFeatures {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn descriptor(&self, index: usize) -> Result<LineDescriptor, ExtractionError> {
        descriptor_row(&self.descriptors, index as i32)
    }
}

pub struct LineExtractor {
    config: LineExtractorConfig,
    backend: Box<dyn LineBackend>,
    dynamic: DynamicFilter,
}

impl LineExtractor {
    /// Build an extractor with the backend named in `config`.
    pub fn new(config: LineExtractorConfig) -> Result<Self, ExtractionError> {
        let backend: Box<dyn LineBackend> = match config.detector {
            DetectorKind::Lsd => Box::new(LsdBackend::new(config.lsd)?),
            DetectorKind::Ed => Box::new(EdBackend::new()?),
        };
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: LineExtractorConfig, backend: Box<dyn LineBackend>) -> Result<Self, ExtractionError> {
        config.validate()?;
        let dynamic = DynamicFilter::new(config.dynamic.clone());
        Ok(Self {
            config,
            backend,
            dynamic,
        })
    }

    pub fn config(&self) -> &LineExtractorConfig {
        &self.config
    }

    /// Extract ranked, described lines from `image`.
    ///
    /// `roi` may be empty; otherwise it must match the image size and lines
    /// whose midpoint lands on a zero pixel are dropped. `instances` carries
    /// segmentation masks used for dynamic-object suppression.
    pub fn extract(
        &mut self,
        image: &Mat,
        roi: &Mat,
        instances: Option<&InstanceMasks>,
    ) -> Result<LineFeatures, ExtractionError> {
        let (rows, cols) = (image.rows(), image.cols());
        if image.empty() || rows <= 0 || cols <= 0 {
            return Err(ExtractionError::EmptyImage { rows, cols });
        }
        if let Some(instances) = instances {
            instances.validate(rows as usize, cols as usize)?;
        }
        if !roi.empty() && (roi.rows() != rows || roi.cols() != cols) {
            return Err(ExtractionError::RoiSizeMismatch {
                rows: roi.rows(),
                cols: roi.cols(),
                image_rows: rows,
                image_cols: cols,
            });
        }

        let gray = to_gray(image)?;
        let params = DetectionParams {
            min_length: self.config.min_line_length_ratio * rows.min(cols) as f32,
            num_levels: self.config.num_levels,
            scale_factor: self.config.scale_factor,
        };

        let detection = self.backend.detect(&gray, &params)?;
        let mut lines = detection.lines;
        let detected = lines.len();

        let roi_removed = if roi.empty() { 0 } else { retain_in_roi(&mut lines, roi)? };

        let dynamic_removed = match instances {
            Some(instances) => self
                .dynamic
                .retain_static(&mut lines, instances, rows as usize, cols as usize)?,
            None => 0,
        };

        cap_by_response(&mut lines, self.config.n_features);

        let descriptors = if lines.is_empty() {
            Mat::default()
        } else {
            let descriptors = self.backend.compute_descriptors(&detection.pyramid.images, &lines)?;
            if descriptors.rows() as usize != lines.len() {
                return Err(ExtractionError::DescriptorCountMismatch {
                    lines: lines.len(),
                    descriptors: descriptors.rows() as usize,
                });
            }
            descriptors
        };

        debug!(
            backend = self.backend.name(),
            detected,
            roi_removed,
            dynamic_removed,
            kept = lines.len(),
            "extracted lines"
        );

        Ok(LineFeatures {
            lines,
            descriptors,
            scales: detection.pyramid.scales,
            pyramid: detection.pyramid.images,
        })
    }
}

fn to_gray(image: &Mat) -> Result<Mat, ExtractionError> {
    match image.channels() {
        1 => Ok(image.try_clone()?),
        4 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(image, &mut gray, imgproc::COLOR_BGRA2GRAY)?;
            Ok(gray)
        }
        _ => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(image, &mut gray, imgproc::COLOR_BGR2GRAY)?;
            Ok(gray)
        }
    }
}

/// Keep lines whose midpoint lies on a non-zero ROI pixel.
fn retain_in_roi(lines: &mut Vec<KeyLine>, roi: &Mat) -> Result<usize, ExtractionError> {
    let before = lines.len();
    let (max_x, max_y) = (roi.cols() - 1, roi.rows() - 1);
    let mut kept = Vec::with_capacity(before);
    for line in lines.drain(..) {
        let mid = line.midpoint();
        let x = (mid.x.round() as i32).clamp(0, max_x);
        let y = (mid.y.round() as i32).clamp(0, max_y);
        if *roi.at_2d::<u8>(y, x)? != 0 {
            kept.push(line);
        }
    }
    *lines = kept;
    Ok(before - lines.len())
}

/// Keep the `cap` strongest lines and renumber them `0..cap`. A cap of 0
/// keeps every line untouched.
pub fn cap_by_response(lines: &mut Vec<KeyLine>, cap: usize) {
    if cap == 0 || lines.len() <= cap {
        return;
    }
    lines.sort_by(|a, b| b.response.total_cmp(&a.response));
    lines.truncate(cap);
    for (rank, line) in lines.iter_mut().enumerate() {
        line.class_id = rank as i32;
    }
}
