//! Map module - core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] / [`MapLine`] - 3D point and line landmarks
//! - [`MapGraph`] - Arena holding the entities and their links
//! - [`Map`] - Thread-safe store around the arena
//!
//! # Architecture
//!
//! Entities live in `HashMap`s keyed by id and refer to each other only by
//! id:
//! - KeyFrames observe landmarks (KF → MP/ML via feature slots)
//! - Landmarks track their observers (MP/ML → KF via `observations`)
//!
//! KeyFrames also maintain the essential graph:
//! - **Covisibility Graph**: edges weighted by shared landmark count
//! - **Spanning Tree**: parent/children links rooted at the origin
//! - **Loop Edges**: accepted loop closures
//!
//! # Example
//!
//! ```ignore
//! use rust_plslam::atlas::{IdRegistry, map::Map};
//!
//! let map = Map::new(IdRegistry::new());
//! let kf_id = map.create_keyframe(timestamp, pose, num_points, num_lines)?;
//! let mp_id = map.create_map_point(position, descriptor, kf_id)?;
//! map.associate_point(kf_id, feature_idx, mp_id);
//! let local_kfs = map.local_keyframes(kf_id, 10);
//! ```

pub mod graph;
pub mod keyframe;
pub mod map;
pub mod map_line;
pub mod map_point;
pub mod semantic;
pub mod snapshot;
pub mod types;

pub use graph::MapGraph;
pub use keyframe::KeyFrame;
pub use map::{Map, MapStatus, THUMB_HEIGHT, THUMB_WIDTH};
pub use map_line::{LineDescriptor, MapLine};
pub use map_point::{MapPoint, OrbDescriptor};
pub use semantic::{Bound3D, SemanticLayer, SemanticPoint};
pub use snapshot::{MapEntities, MapSnapshot, PostLoadReport, SNAPSHOT_VERSION};
pub use types::{CameraId, KeyFrameId, MapId, MapLineId, MapPointId};
