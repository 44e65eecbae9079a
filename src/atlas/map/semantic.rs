//! Semantic overlay kept alongside the geometric map.
//!
//! These records are produced by the dynamic-object pipeline and consumed by
//! viewers. They are not part of the essential graph and are not persisted
//! with the map snapshot.

use nalgebra::Vector3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Labelled axis-aligned 3D box around a reconstructed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bound3D {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
    pub label: String,
}

impl Bound3D {
    pub fn contains(&self, p: &Vector3<f64>) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }
}

/// World point with an RGB colour in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SemanticPoint {
    pub position: Vector3<f64>,
    pub color: [f32; 3],
}

#[derive(Debug, Default, Clone)]
struct SemanticRecords {
    points: Vec<SemanticPoint>,
    camera_centres: Vec<Vector3<f64>>,
    bounds: Vec<Bound3D>,
    person_track: Vec<Vector3<f64>>,
    delaunay_lines: Vec<(Vector3<f64>, Vector3<f64>)>,
}

/// Append-only semantic records behind their own lock.
///
/// The lock is independent of the map-update lock and is never held while
/// taking it.
#[derive(Debug, Default)]
pub struct SemanticLayer {
    records: Mutex<SemanticRecords>,
}

impl SemanticLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_point(&self, position: Vector3<f64>, color: [f32; 3]) {
        self.records
            .lock()
            .points
            .push(SemanticPoint { position, color });
    }

    pub fn add_camera_centre(&self, centre: Vector3<f64>) {
        self.records.lock().camera_centres.push(centre);
    }

    /// Add a labelled box. Corners are reordered so `min <= max` per axis.
    pub fn add_bound(&self, a: Vector3<f64>, b: Vector3<f64>, label: impl Into<String>) {
        let bound = Bound3D {
            min: a.inf(&b),
            max: a.sup(&b),
            label: label.into(),
        };
        self.records.lock().bounds.push(bound);
    }

    pub fn add_person_track(&self, centre: Vector3<f64>) {
        self.records.lock().person_track.push(centre);
    }

    pub fn add_delaunay_line(&self, start: Vector3<f64>, end: Vector3<f64>) {
        self.records.lock().delaunay_lines.push((start, end));
    }

    pub fn points(&self) -> Vec<SemanticPoint> {
        self.records.lock().points.clone()
    }

    pub fn camera_centres(&self) -> Vec<Vector3<f64>> {
        self.records.lock().camera_centres.clone()
    }

    pub fn bounds(&self) -> Vec<Bound3D> {
        self.records.lock().bounds.clone()
    }

    pub fn person_track(&self) -> Vec<Vector3<f64>> {
        self.records.lock().person_track.clone()
    }

    pub fn delaunay_lines(&self) -> Vec<(Vector3<f64>, Vector3<f64>)> {
        self.records.lock().delaunay_lines.clone()
    }

    pub fn clear(&self) {
        *self.records.lock() = SemanticRecords::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_is_normalised() {
        let layer = SemanticLayer::new();
        layer.add_bound(Vector3::new(1.0, -1.0, 2.0), Vector3::new(0.0, 1.0, 0.0), "chair");

        let bounds = layer.bounds();
        assert_eq!(bounds.len(), 1);
        assert_eq!(bounds[0].min, Vector3::new(0.0, -1.0, 0.0));
        assert_eq!(bounds[0].max, Vector3::new(1.0, 1.0, 2.0));
        assert!(bounds[0].contains(&Vector3::new(0.5, 0.0, 1.0)));
        assert!(!bounds[0].contains(&Vector3::new(0.5, 0.0, 3.0)));
    }

    #[test]
    fn test_clear() {
        let layer = SemanticLayer::new();
        layer.add_point(Vector3::zeros(), [1.0, 0.0, 0.0]);
        layer.add_person_track(Vector3::new(1.0, 0.0, 0.0));
        layer.add_delaunay_line(Vector3::zeros(), Vector3::x());
        layer.add_camera_centre(Vector3::zeros());
        assert_eq!(layer.points().len(), 1);
        assert_eq!(layer.person_track().len(), 1);

        layer.clear();
        assert!(layer.points().is_empty());
        assert!(layer.person_track().is_empty());
        assert!(layer.delaunay_lines().is_empty());
        assert!(layer.camera_centres().is_empty());
    }
}
