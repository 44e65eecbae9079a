//! Atlas module - map storage for the SLAM back end.
//!
//! - [`map`] - per-session map store (keyframes, point and line landmarks)
//! - [`ids`] - id allocation shared by every map of an atlas
//! - [`keyframe_db`] - BoW keyframe index for place recognition
//! - [`Atlas`] - multi-map container with save / load

pub mod atlas;
pub mod ids;
pub mod keyframe_db;
pub mod map;

pub use atlas::{Atlas, AtlasArchive};
pub use ids::{IdAllocator, IdRegistry};
pub use keyframe_db::{BowVector, KeyFrameDatabase, Vocabulary};
pub use map::{KeyFrame, KeyFrameId, Map, MapLine, MapLineId, MapPoint, MapPointId};
