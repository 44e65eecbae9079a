//! Detected 2D line segment.

use opencv::core::{Mat, Point2f};
use opencv::line_descriptor;
use opencv::prelude::*;

use crate::atlas::map::LineDescriptor;
use crate::error::ExtractionError;

/// A line segment found in one pyramid level.
///
/// Full-resolution endpoints are in level-0 pixel coordinates; the
/// `*_octave` endpoints are in the coordinates of the level it was found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyLine {
    pub start: Point2f,
    pub end: Point2f,
    pub start_octave: Point2f,
    pub end_octave: Point2f,
    /// Length in octave coordinates.
    pub length: f32,
    /// Orientation in radians.
    pub angle: f32,
    /// Length relative to the larger dimension of the octave image.
    pub response: f32,
    pub octave: i32,
    /// Index of the line in the final list.
    pub class_id: i32,
    pub num_pixels: i32,
}

impl KeyLine {
    /// Build a keyline from octave endpoints found at pyramid `octave`,
    /// scaling them back to full resolution by `scale`.
    pub fn from_octave_segment(
        start_octave: Point2f,
        end_octave: Point2f,
        octave: i32,
        scale: f32,
        octave_size: (i32, i32),
    ) -> Self {
        let dx = end_octave.x - start_octave.x;
        let dy = end_octave.y - start_octave.y;
        let length = dx.hypot(dy);
        let (cols, rows) = octave_size;
        Self {
            start: Point2f::new(start_octave.x * scale, start_octave.y * scale),
            end: Point2f::new(end_octave.x * scale, end_octave.y * scale),
            start_octave,
            end_octave,
            length,
            angle: dy.atan2(dx),
            response: length / cols.max(rows).max(1) as f32,
            octave,
            class_id: 0,
            num_pixels: length.round() as i32,
        }
    }

    pub fn midpoint(&self) -> Point2f {
        Point2f::new((self.start.x + self.end.x) * 0.5, (self.start.y + self.end.y) * 0.5)
    }

    /// OpenCV keyline local to the level the line was found in: octave 0,
    /// with both endpoint pairs in that level's coordinates.
    pub(crate) fn to_octave_cv(self, class_id: i32) -> line_descriptor::KeyLine {
        let (s, e) = (self.start_octave, self.end_octave);
        line_descriptor::KeyLine {
            angle: self.angle,
            class_id,
            octave: 0,
            pt: Point2f::new((s.x + e.x) * 0.5, (s.y + e.y) * 0.5),
            response: self.response,
            size: (e.x - s.x).abs() * (e.y - s.y).abs(),
            start_point_x: s.x,
            start_point_y: s.y,
            end_point_x: e.x,
            end_point_y: e.y,
            s_point_in_octave_x: s.x,
            s_point_in_octave_y: s.y,
            e_point_in_octave_x: e.x,
            e_point_in_octave_y: e.y,
            line_length: self.length,
            num_of_pixels: self.num_pixels,
        }
    }
}

/// Copy row `row` of an `N x 32` CV_8U descriptor matrix.
pub fn descriptor_row(descriptors: &Mat, row: i32) -> Result<LineDescriptor, ExtractionError> {
    let mut out = [0u8; 32];
    for (col, byte) in out.iter_mut().enumerate() {
        *byte = *descriptors.at_2d::<u8>(row, col as i32)?;
    }
    Ok(out)
}
