//! Dynamic-object suppression.
//!
//! Instance masks of moving classes are merged into one occupancy image.
//! Lines with an endpoint inside, or within a tolerance outside, any of its
//! external contours are dropped before they reach the map.

use opencv::core::{CV_8UC1, Mat, Point, Point2f, Scalar, Vector};
use opencv::imgproc;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ExtractionError;

use super::keyline::KeyLine;

/// Per-pixel instance masks from a segmentation service.
///
/// `masks` holds one `rows x cols` row-major mask per label, concatenated.
/// A pixel belongs to the instance when its value is exactly 1.
#[derive(Debug, Clone, Default)]
pub struct InstanceMasks {
    pub labels: Vec<String>,
    /// Detection confidence per label, if the service reports one.
    pub scores: Option<Vec<f32>>,
    pub masks: Vec<u8>,
}

impl InstanceMasks {
    pub fn new(labels: Vec<String>, masks: Vec<u8>) -> Self {
        Self {
            labels,
            scores: None,
            masks,
        }
    }

    pub fn with_scores(mut self, scores: Vec<f32>) -> Self {
        self.scores = Some(scores);
        self
    }

    /// Check the buffer against the image size.
    pub fn validate(&self, rows: usize, cols: usize) -> Result<(), ExtractionError> {
        let labels = self.labels.len();
        let expected = rows * cols * labels;
        if self.masks.len() != expected {
            return Err(ExtractionError::MaskSizeMismatch {
                expected,
                actual: self.masks.len(),
                labels,
                rows,
                cols,
            });
        }
        if let Some(scores) = &self.scores {
            if scores.len() != labels {
                return Err(ExtractionError::LabelCountMismatch {
                    what: "score",
                    actual: scores.len(),
                    labels,
                });
            }
        }
        Ok(())
    }

    fn instance(&self, index: usize, pixels: usize) -> &[u8] {
        &self.masks[index * pixels..(index + 1) * pixels]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    /// Labels treated as moving objects.
    pub classes: Vec<String>,
    /// Distance in pixels outside a contour that still counts as touching it.
    pub tolerance: f64,
    /// Instances scored below this are ignored.
    pub min_score: f32,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            classes: vec!["person".to_string()],
            tolerance: 15.0,
            min_score: 0.4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DynamicFilter {
    config: DynamicConfig,
}

impl DynamicFilter {
    pub fn new(config: DynamicConfig) -> Self {
        Self { config }
    }

    fn is_dynamic(&self, instances: &InstanceMasks, index: usize) -> bool {
        let label = &instances.labels[index];
        if !self.config.classes.iter().any(|c| c == label) {
            return false;
        }
        instances
            .scores
            .as_ref()
            .is_none_or(|scores| scores[index] >= self.config.min_score)
    }

    /// Union of the dynamic instance masks as a CV_8UC1 image (0 or 255).
    ///
    /// Returns `None` when no instance qualifies.
    pub fn occupancy(&self, instances: &InstanceMasks, rows: usize, cols: usize) -> Result<Option<Mat>, ExtractionError> {
        instances.validate(rows, cols)?;
        let pixels = rows * cols;

        let mut occupied = vec![false; pixels];
        let mut any = false;
        for index in (0..instances.labels.len()).filter(|&i| self.is_dynamic(instances, i)) {
            any = true;
            for (cell, &value) in occupied.iter_mut().zip(instances.instance(index, pixels)) {
                *cell |= value == 1;
            }
        }
        if !any {
            return Ok(None);
        }

        let mut image = Mat::new_rows_cols_with_default(rows as i32, cols as i32, CV_8UC1, Scalar::all(0.0))?;
        for (i, _) in occupied.iter().enumerate().filter(|(_, o)| **o) {
            *image.at_2d_mut::<u8>((i / cols) as i32, (i % cols) as i32)? = 255;
        }
        Ok(Some(image))
    }

    /// External contours of the dynamic occupancy image.
    pub fn contours(
        &self,
        instances: &InstanceMasks,
        rows: usize,
        cols: usize,
    ) -> Result<Vector<Vector<Point>>, ExtractionError> {
        let mut contours = Vector::<Vector<Point>>::new();
        if let Some(occupancy) = self.occupancy(instances, rows, cols)? {
            imgproc::find_contours(
                &occupancy,
                &mut contours,
                imgproc::RETR_EXTERNAL,
                imgproc::CHAIN_APPROX_NONE,
                Point::new(0, 0),
            )?;
        }
        Ok(contours)
    }

    /// True if `p` is inside `contour` or within the tolerance outside it.
    fn touches(&self, contour: &Vector<Point>, p: Point2f) -> Result<bool, ExtractionError> {
        // Endpoints are tested at integer pixel positions.
        let p = Point2f::new(p.x.round(), p.y.round());
        Ok(imgproc::point_polygon_test(contour, p, true)? >= -self.config.tolerance)
    }

    /// Drop every line with either endpoint touching a dynamic contour.
    ///
    /// Returns the number of removed lines.
    pub fn retain_static(
        &self,
        lines: &mut Vec<KeyLine>,
        instances: &InstanceMasks,
        rows: usize,
        cols: usize,
    ) -> Result<usize, ExtractionError> {
        let contours = self.contours(instances, rows, cols)?;
        if contours.is_empty() {
            return Ok(0);
        }

        let before = lines.len();
        let mut kept = Vec::with_capacity(before);
        'lines: for line in lines.drain(..) {
            for contour in contours.iter() {
                if self.touches(&contour, line.start)? || self.touches(&contour, line.end)? {
                    continue 'lines;
                }
            }
            kept.push(line);
        }
        *lines = kept;
        Ok(before - lines.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROWS: usize = 100;
    const COLS: usize = 100;

    /// One mask per label; each label gets a filled square `[lo, hi)`.
    fn square_masks(labels: &[(&str, usize, usize)]) -> InstanceMasks {
        let mut masks = vec![0u8; ROWS * COLS * labels.len()];
        for (n, (_, lo, hi)) in labels.iter().enumerate() {
            for r in *lo..*hi {
                for c in *lo..*hi {
                    masks[n * ROWS * COLS + r * COLS + c] = 1;
                }
            }
        }
        InstanceMasks::new(labels.iter().map(|(l, _, _)| l.to_string()).collect(), masks)
    }

    fn line(x0: f32, y0: f32, x1: f32, y1: f32) -> KeyLine {
        KeyLine::from_octave_segment(Point2f::new(x0, y0), Point2f::new(x1, y1), 0, 1.0, (COLS as i32, ROWS as i32))
    }

    #[test]
    fn test_either_endpoint_suppresses() {
        let filter = DynamicFilter::new(DynamicConfig::default());
        let masks = square_masks(&[("person", 40, 60)]);

        let mut lines = vec![
            line(50.0, 50.0, 95.0, 95.0), // start inside
            line(5.0, 5.0, 30.0, 50.0),   // end 10px left of the contour
            line(2.0, 2.0, 20.0, 2.0),    // far away
            line(2.0, 95.0, 95.0, 95.0),  // far away, long
        ];
        let removed = filter.retain_static(&mut lines, &masks, ROWS, COLS).unwrap();

        assert_eq!(removed, 2);
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|l| l.start.y < 10.0 || l.start.y > 90.0));
    }

    #[test]
    fn test_static_classes_are_ignored() {
        let filter = DynamicFilter::new(DynamicConfig::default());
        let masks = square_masks(&[("chair", 40, 60)]);

        let mut lines = vec![line(50.0, 50.0, 55.0, 55.0)];
        assert_eq!(filter.retain_static(&mut lines, &masks, ROWS, COLS).unwrap(), 0);
        assert_eq!(lines.len(), 1);
    }

    #[test]
    fn test_low_score_instance_is_ignored() {
        let filter = DynamicFilter::new(DynamicConfig::default());
        let masks = square_masks(&[("person", 40, 60)]).with_scores(vec![0.2]);

        let mut lines = vec![line(50.0, 50.0, 55.0, 55.0)];
        assert_eq!(filter.retain_static(&mut lines, &masks, ROWS, COLS).unwrap(), 0);
    }

    #[test]
    fn test_multiple_instances_merge() {
        let filter = DynamicFilter::new(DynamicConfig::default());
        let masks = square_masks(&[("person", 10, 20), ("person", 70, 80)]);

        let occupancy = filter.occupancy(&masks, ROWS, COLS).unwrap().unwrap();
        assert_eq!(*occupancy.at_2d::<u8>(15, 15).unwrap(), 255);
        assert_eq!(*occupancy.at_2d::<u8>(75, 75).unwrap(), 255);
        assert_eq!(*occupancy.at_2d::<u8>(50, 50).unwrap(), 0);
        assert_eq!(filter.contours(&masks, ROWS, COLS).unwrap().len(), 2);
    }

    #[test]
    fn test_mask_size_mismatch() {
        let filter = DynamicFilter::new(DynamicConfig::default());
        let mut masks = square_masks(&[("person", 40, 60)]);
        masks.masks.pop();

        let mut lines = vec![line(0.0, 0.0, 10.0, 0.0)];
        let err = filter.retain_static(&mut lines, &masks, ROWS, COLS).unwrap_err();
        assert!(matches!(
            err,
            ExtractionError::MaskSizeMismatch { expected: 10_000, actual: 9_999, labels: 1, .. }
        ));

        let bad_scores = square_masks(&[("person", 40, 60)]).with_scores(vec![0.9, 0.9]);
        assert!(matches!(
            bad_scores.validate(ROWS, COLS),
            Err(ExtractionError::LabelCountMismatch { actual: 2, labels: 1, .. })
        ));
    }
}
