//! Line detector backends.
//!
//! A backend turns an image into keylines across a Gaussian pyramid and
//! computes LBD descriptors for a final list of keylines on that same
//! pyramid. Two OpenCV detectors are provided:
//! - [`LsdBackend`]: imgproc line segment detector with full parameter set
//! - [`EdBackend`]: edge-drawing detector from `line_descriptor`

use opencv::core::{CV_8UC1, Mat, Point2f, Ptr, Scalar, Vec4f, Vector};
use opencv::imgproc;
use opencv::line_descriptor::{self, BinaryDescriptor};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

use super::keyline::KeyLine;
use super::pyramid::Pyramid;

/// Per-call detection settings derived from the extractor config and image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Minimum segment length in octave pixels.
    pub min_length: f32,
    pub num_levels: usize,
    pub scale_factor: f32,
}

/// Raw detector output.
pub struct Detection {
    pub lines: Vec<KeyLine>,
    pub pyramid: Pyramid,
}

pub trait LineBackend: Send {
    fn name(&self) -> &'static str;

    /// Detect keylines over every pyramid level. `class_id` numbers the
    /// returned lines in order.
    fn detect(&mut self, image: &Mat, params: &DetectionParams) -> Result<Detection, ExtractionError>;

    /// One descriptor row per line, in the order of `lines`. `pyramid` is
    /// the level images returned by [`detect`](Self::detect); each line is
    /// described on the level it was found in.
    fn compute_descriptors(&mut self, pyramid: &[Mat], lines: &[KeyLine]) -> Result<Mat, ExtractionError>;
}

/// LSD tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LsdParams {
    /// `imgproc::LSD_REFINE_NONE`, `_STD` or `_ADV`.
    pub refine: i32,
    pub scale: f64,
    pub sigma_scale: f64,
    pub quant: f64,
    pub ang_th: f64,
    pub log_eps: f64,
    pub density_th: f64,
    pub n_bins: i32,
}

impl Default for LsdParams {
    fn default() -> Self {
        Self {
            refine: imgproc::LSD_REFINE_STD,
            scale: 0.8,
            sigma_scale: 0.6,
            quant: 2.0,
            ang_th: 22.5,
            log_eps: 1.0,
            density_th: 0.6,
            n_bins: 1024,
        }
    }
}

/// Bytes per LBD descriptor row.
const LBD_BYTES: i32 = 32;

/// Binary line descriptor shared by both backends.
///
/// OpenCV's LBD samples each keyline from a half-scale pyramid of its own,
/// so it only ever sees octave-0 keylines on the image of the level they
/// were found in.
struct Lbd {
    descriptor: Ptr<BinaryDescriptor>,
}

impl Lbd {
    fn new() -> Result<Self, ExtractionError> {
        let mut descriptor = BinaryDescriptor::create_binary_descriptor()?;
        descriptor.set_num_of_octaves(1)?;
        Ok(Self { descriptor })
    }

    fn compute(&mut self, pyramid: &[Mat], lines: &[KeyLine]) -> Result<Mat, ExtractionError> {
        if lines.is_empty() {
            return Ok(Mat::default());
        }

        let mut by_level: Vec<Vec<usize>> = vec![Vec::new(); pyramid.len()];
        for (i, line) in lines.iter().enumerate() {
            let level = usize::try_from(line.octave)
                .ok()
                .filter(|level| *level < pyramid.len())
                .ok_or_else(|| {
                    ExtractionError::InvalidConfig(format!(
                        "line {i} has octave {} outside a {}-level pyramid",
                        line.octave,
                        pyramid.len()
                    ))
                })?;
            by_level[level].push(i);
        }

        let mut descriptors =
            Mat::new_rows_cols_with_default(lines.len() as i32, LBD_BYTES, CV_8UC1, Scalar::all(0.0))?;
        for (level, members) in by_level.iter().enumerate() {
            if members.is_empty() {
                continue;
            }
            // LBD indexes its output rows by class_id.
            let mut cv_lines: Vector<line_descriptor::KeyLine> = members
                .iter()
                .enumerate()
                .map(|(j, &i)| lines[i].to_octave_cv(j as i32))
                .collect();

            let mut level_descriptors = Mat::default();
            self.descriptor
                .compute_def(&pyramid[level], &mut cv_lines, &mut level_descriptors)?;
            if level_descriptors.rows() as usize != members.len() {
                return Err(ExtractionError::DescriptorCountMismatch {
                    lines: members.len(),
                    descriptors: level_descriptors.rows() as usize,
                });
            }

            for (j, &i) in members.iter().enumerate() {
                for col in 0..LBD_BYTES {
                    *descriptors.at_2d_mut::<u8>(i as i32, col)? = *level_descriptors.at_2d::<u8>(j as i32, col)?;
                }
            }
        }
        Ok(descriptors)
    }
}

/// Run `detect_level` on every pyramid level and lift the segments to
/// full-resolution keylines, dropping those shorter than `min_length`.
fn detect_over_pyramid(
    pyramid: &Pyramid,
    min_length: f32,
    mut detect_level: impl FnMut(&Mat) -> Result<Vec<(Point2f, Point2f)>, ExtractionError>,
) -> Result<Vec<KeyLine>, ExtractionError> {
    let mut lines = Vec::new();
    for (level, image) in pyramid.images.iter().enumerate() {
        let scale = pyramid.scales.scale_factors[level];
        let size = (image.cols(), image.rows());
        for (start, end) in detect_level(image)? {
            let mut kl = KeyLine::from_octave_segment(start, end, level as i32, scale, size);
            if kl.length < min_length {
                continue;
            }
            kl.class_id = lines.len() as i32;
            lines.push(kl);
        }
    }
    Ok(lines)
}

pub struct LsdBackend {
    lsd: Ptr<imgproc::LineSegmentDetector>,
    lbd: Lbd,
}

impl LsdBackend {
    pub fn new(params: LsdParams) -> Result<Self, ExtractionError> {
        let lsd = imgproc::create_line_segment_detector(
            params.refine,
            params.scale,
            params.sigma_scale,
            params.quant,
            params.ang_th,
            params.log_eps,
            params.density_th,
            params.n_bins,
        )?;
        Ok(Self { lsd, lbd: Lbd::new()? })
    }
}

impl LineBackend for LsdBackend {
    fn name(&self) -> &'static str {
        "lsd"
    }

    fn detect(&mut self, image: &Mat, params: &DetectionParams) -> Result<Detection, ExtractionError> {
        let pyramid = Pyramid::build(image, params.scale_factor, params.num_levels)?;
        let lsd = &mut self.lsd;
        let lines = detect_over_pyramid(&pyramid, params.min_length, |level| {
            let mut segments = Vector::<Vec4f>::new();
            let mut width = Mat::default();
            let mut prec = Mat::default();
            let mut nfa = Mat::default();
            lsd.detect(level, &mut segments, &mut width, &mut prec, &mut nfa)?;
            Ok(segments
                .iter()
                .map(|s| (Point2f::new(s[0], s[1]), Point2f::new(s[2], s[3])))
                .collect())
        })?;
        Ok(Detection { lines, pyramid })
    }

    fn compute_descriptors(&mut self, pyramid: &[Mat], lines: &[KeyLine]) -> Result<Mat, ExtractionError> {
        self.lbd.compute(pyramid, lines)
    }
}

pub struct EdBackend {
    ed: Ptr<BinaryDescriptor>,
    lbd: Lbd,
}

impl EdBackend {
    pub fn new() -> Result<Self, ExtractionError> {
        let mut ed = BinaryDescriptor::create_binary_descriptor()?;
        // The pyramid is ours; run the detector once per level.
        ed.set_num_of_octaves(1)?;
        Ok(Self { ed, lbd: Lbd::new()? })
    }
}

impl LineBackend for EdBackend {
    fn name(&self) -> &'static str {
        "ed"
    }

    fn detect(&mut self, image: &Mat, params: &DetectionParams) -> Result<Detection, ExtractionError> {
        let pyramid = Pyramid::build(image, params.scale_factor, params.num_levels)?;
        let ed = &mut self.ed;
        let lines = detect_over_pyramid(&pyramid, params.min_length, |level| {
            let mut found = Vector::<line_descriptor::KeyLine>::new();
            ed.detect_def(level, &mut found)?;
            Ok(found
                .iter()
                .map(|kl| {
                    (
                        Point2f::new(kl.start_point_x, kl.start_point_y),
                        Point2f::new(kl.end_point_x, kl.end_point_y),
                    )
                })
                .collect())
        })?;
        Ok(Detection { lines, pyramid })
    }

    fn compute_descriptors(&mut self, pyramid: &[Mat], lines: &[KeyLine]) -> Result<Mat, ExtractionError> {
        self.lbd.compute(pyramid, lines)
    }
}
