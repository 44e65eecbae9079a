//! Atlas - multi-map container.
//!
//! The Atlas owns one or more [`Map`]s:
//! - One **current** map where tracking, local mapping and loop closing operate.
//! - Zero or more **stored** maps which may be re-activated later.
//!
//! It also owns the id registry shared by its maps, the camera models the
//! keyframes refer to and the [`KeyFrameDatabase`] used for place
//! recognition. Saving and loading go through each map's snapshot.

use std::collections::{BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::atlas::ids::IdRegistry;
use crate::atlas::map::{CameraId, Map, MapEntities, MapId, MapSnapshot, PostLoadReport};
use crate::atlas::map::snapshot::{read_versioned, write_versioned};
use crate::camera::CameraModel;
use crate::error::MapError;

use super::keyframe_db::{KeyFrameDatabase, Vocabulary};

/// Everything written by [`Atlas::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasArchive {
    pub maps: Vec<(MapSnapshot, MapEntities)>,
    pub cameras: Vec<CameraModel>,
    pub current_map: Option<MapId>,
}

/// Top-level multi-map container.
pub struct Atlas {
    maps: Vec<Arc<Map>>,
    /// Index of the current map inside `maps`.
    current: usize,
    registry: Arc<IdRegistry>,
    cameras: HashMap<CameraId, CameraModel>,
    /// Shared keyframe database for place recognition.
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    /// Create an Atlas with a single empty current map.
    pub fn new() -> Self {
        Self::with_registry(IdRegistry::new())
    }

    pub fn with_registry(registry: Arc<IdRegistry>) -> Self {
        let map = Arc::new(Map::new(registry.clone()));
        map.set_current_map();
        Self {
            maps: vec![map],
            current: 0,
            registry,
            cameras: HashMap::new(),
            keyframe_db: KeyFrameDatabase::new(),
        }
    }

    pub fn registry(&self) -> &Arc<IdRegistry> {
        &self.registry
    }

    pub fn num_maps(&self) -> usize {
        self.maps.len()
    }

    pub fn current_map(&self) -> Arc<Map> {
        self.maps[self.current].clone()
    }

    pub fn all_maps(&self) -> &[Arc<Map>] {
        &self.maps
    }

    pub fn map(&self, id: MapId) -> Option<Arc<Map>> {
        self.maps.iter().find(|m| m.id() == id).cloned()
    }

    /// Park the current map and start a new empty one.
    pub fn create_new_map(&mut self) -> Arc<Map> {
        self.maps[self.current].set_stored_map();

        let map = Arc::new(Map::new(self.registry.clone()));
        map.set_current_map();
        self.maps.push(map.clone());
        self.current = self.maps.len() - 1;
        info!(map = %map.id(), total = self.maps.len(), "new map created");
        map
    }

    /// Make `id` the current map and park every other one.
    pub fn set_current_map(&mut self, id: MapId) -> Result<(), MapError> {
        let idx = self
            .maps
            .iter()
            .position(|m| m.id() == id && !m.is_bad())
            .ok_or(MapError::UnknownMap(id))?;

        for (i, map) in self.maps.iter().enumerate() {
            if i != idx && map.is_in_use() {
                map.set_stored_map();
            }
        }
        self.maps[idx].set_current_map();
        self.current = idx;
        Ok(())
    }

    /// Rename a map, rejecting ids already used by another map.
    pub fn change_map_id(&mut self, from: MapId, to: MapId) -> Result<(), MapError> {
        if from == to {
            return Ok(());
        }
        if self.maps.iter().any(|m| m.id() == to) {
            return Err(MapError::MapIdCollision(to));
        }
        let map = self.map(from).ok_or(MapError::UnknownMap(from))?;
        map.change_id(to);
        self.keyframe_db.rename_map(from, to);
        Ok(())
    }

    /// Drop maps marked bad, keeping the current one.
    pub fn remove_bad_maps(&mut self) -> usize {
        let current_id = self.maps[self.current].id();
        let before = self.maps.len();

        let (bad, kept): (Vec<_>, Vec<_>) = self
            .maps
            .drain(..)
            .partition(|m| m.is_bad() && m.id() != current_id);
        for map in &bad {
            self.keyframe_db.clear_map(map.id());
        }
        self.maps = kept;
        self.current = self
            .maps
            .iter()
            .position(|m| m.id() == current_id)
            .unwrap_or(0);

        before - self.maps.len()
    }

    pub fn add_camera(&mut self, camera: CameraModel) {
        self.cameras.insert(camera.id, camera);
    }

    pub fn camera(&self, id: CameraId) -> Option<&CameraModel> {
        self.cameras.get(&id)
    }

    /// Write every usable map and the cameras they reference.
    ///
    /// A bad current map is not written, and neither is its id.
    pub fn save<W: Write>(&self, writer: W) -> Result<(), MapError> {
        let mut used_cameras = BTreeSet::new();
        let maps: Vec<_> = self
            .maps
            .iter()
            .filter(|m| !m.is_bad())
            .map(|m| m.pre_save(&mut used_cameras))
            .collect();

        let archive = AtlasArchive {
            cameras: used_cameras
                .iter()
                .filter_map(|id| self.cameras.get(id).copied())
                .collect(),
            current_map: Some(&self.maps[self.current])
                .filter(|m| !m.is_bad())
                .map(|m| m.id()),
            maps,
        };
        write_versioned(writer, &archive)?;
        info!(maps = archive.maps.len(), cameras = archive.cameras.len(), "atlas saved");
        Ok(())
    }

    /// Restore an atlas written by [`save`](Self::save).
    ///
    /// Keyframes are re-indexed in a fresh keyframe database, computing BoW
    /// vectors through `vocabulary` where they were not saved.
    pub fn load<R: Read>(reader: R, vocabulary: &dyn Vocabulary) -> Result<(Self, Vec<PostLoadReport>), MapError> {
        let archive: AtlasArchive = read_versioned(reader)?;
        let registry = IdRegistry::new();
        let cameras: HashMap<CameraId, CameraModel> = archive.cameras.iter().map(|c| (c.id, *c)).collect();
        let mut keyframe_db = KeyFrameDatabase::new();

        let mut maps = Vec::with_capacity(archive.maps.len());
        let mut reports = Vec::with_capacity(archive.maps.len());
        for (snapshot, entities) in archive.maps {
            let map = Map::from_snapshot(snapshot, registry.clone());
            reports.push(map.post_load(&mut keyframe_db, vocabulary, &entities, &cameras));
            maps.push(Arc::new(map));
        }

        if maps.is_empty() {
            let mut atlas = Self::with_registry(registry);
            atlas.cameras = cameras;
            return Ok((atlas, reports));
        }

        let current = match archive.current_map.and_then(|id| maps.iter().position(|m| m.id() == id)) {
            Some(idx) => idx,
            None => {
                info!("no saved current map, activating the last one");
                maps.len() - 1
            }
        };
        maps[current].set_current_map();

        info!(maps = maps.len(), "atlas loaded");
        Ok((
            Self {
                maps,
                current,
                registry,
                cameras,
                keyframe_db,
            },
            reports,
        ))
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}
