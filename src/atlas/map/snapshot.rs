//! Persisted form of a map.
//!
//! A map is saved as two parts: the [`MapSnapshot`] header (counters, flags
//! and the ids of every live entity) and the [`MapEntities`] themselves.
//! Entities only reference each other by id, so restoring is a matter of
//! re-inserting them and dropping links to anything that did not survive.

use std::collections::HashMap;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::MapError;

use super::keyframe::KeyFrame;
use super::map_line::MapLine;
use super::map_point::MapPoint;
use super::types::{CameraId, KeyFrameId, MapId, MapLineId, MapPointId};

/// Current on-disk schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Map header written at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSnapshot {
    pub version: u32,
    pub map_id: MapId,
    pub init_kf_id: u64,
    pub max_kf_id: u64,
    pub last_loop_kf_id: u64,
    pub big_change_index: u64,

    pub keyframe_ids: Vec<KeyFrameId>,
    pub map_point_ids: Vec<MapPointId>,
    pub map_line_ids: Vec<MapLineId>,
    pub origin_ids: Vec<KeyFrameId>,
    pub lower_kf_id: Option<KeyFrameId>,
    pub initial_kf_id: Option<KeyFrameId>,

    pub imu_initialized: bool,
    pub is_inertial: bool,
    pub inertial_ba1: bool,
    pub inertial_ba2: bool,

    /// Cameras referenced by the saved keyframes.
    pub camera_ids: Vec<CameraId>,

    pub scale_factor: f64,
    pub num_levels: u32,
    pub thumbnail: Option<Vec<u8>>,
}

impl MapSnapshot {
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), MapError> {
        write_versioned(writer, self)
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, MapError> {
        let snapshot: Self = read_versioned(reader)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(MapError::UnsupportedSnapshotVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

/// Live entities of a map, with references to dropped entities removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapEntities {
    pub keyframes: HashMap<KeyFrameId, KeyFrame>,
    pub map_points: HashMap<MapPointId, MapPoint>,
    pub map_lines: HashMap<MapLineId, MapLine>,
}

/// Outcome of restoring a map from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostLoadReport {
    pub keyframes: usize,
    pub map_points: usize,
    pub map_lines: usize,
    /// Ids listed in the snapshot with no matching entity.
    pub missing_keyframes: usize,
    pub missing_map_points: usize,
    pub missing_map_lines: usize,
    /// Origin, initial or lowest keyframe ids whose keyframe was not restored.
    pub unresolved_backbone: usize,
    /// Links to entities that were not restored.
    pub dropped_references: usize,
    pub unresolved_cameras: usize,
    pub bow_recomputed: usize,
}

/// Write `value` preceded by the schema version.
pub(crate) fn write_versioned<W: Write, T: Serialize>(mut writer: W, value: &T) -> Result<(), MapError> {
    bincode::serialize_into(&mut writer, &SNAPSHOT_VERSION)?;
    bincode::serialize_into(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Read a value written by [`write_versioned`], rejecting other versions
/// before decoding the body.
pub(crate) fn read_versioned<R: Read, T: DeserializeOwned>(mut reader: R) -> Result<T, MapError> {
    let found: u32 = bincode::deserialize_from(&mut reader)?;
    if found != SNAPSHOT_VERSION {
        return Err(MapError::UnsupportedSnapshotVersion {
            found,
            expected: SNAPSHOT_VERSION,
        });
    }
    Ok(bincode::deserialize_from(&mut reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> MapSnapshot {
        MapSnapshot {
            version: SNAPSHOT_VERSION,
            map_id: MapId::new(3),
            init_kf_id: 10,
            max_kf_id: 14,
            last_loop_kf_id: 0,
            big_change_index: 2,
            keyframe_ids: vec![KeyFrameId::new(10), KeyFrameId::new(14)],
            map_point_ids: vec![MapPointId::new(1)],
            map_line_ids: vec![],
            origin_ids: vec![KeyFrameId::new(10)],
            lower_kf_id: Some(KeyFrameId::new(10)),
            initial_kf_id: Some(KeyFrameId::new(10)),
            imu_initialized: true,
            is_inertial: true,
            inertial_ba1: true,
            inertial_ba2: false,
            camera_ids: vec![CameraId::new(0)],
            scale_factor: 1.2,
            num_levels: 8,
            thumbnail: None,
        }
    }

    #[test]
    fn test_snapshot_file_roundtrip() {
        let snapshot = sample_snapshot();
        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();

        let restored = MapSnapshot::read_from(buf.as_slice()).unwrap();
        assert_eq!(restored, snapshot);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut buf = Vec::new();
        bincode::serialize_into(&mut buf, &99u32).unwrap();
        bincode::serialize_into(&mut buf, &sample_snapshot()).unwrap();

        match MapSnapshot::read_from(buf.as_slice()) {
            Err(MapError::UnsupportedSnapshotVersion { found, expected }) => {
                assert_eq!(found, 99);
                assert_eq!(expected, SNAPSHOT_VERSION);
            }
            other => panic!("expected version error, got {other:?}"),
        }
    }
}
