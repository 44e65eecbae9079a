//! Map - thread-safe store for one mapping session.
//!
//! The Map is shared (`Arc<Map>`) between tracking, local mapping and loop
//! closing. It wraps a [`MapGraph`] arena and adds:
//! - id assignment through the atlas-wide [`IdRegistry`]
//! - change notification counters
//! - status flags read by the atlas
//! - the save / restore lifecycle
//!
//! # Locks
//!
//! - **map-update lock** (`graph`): guards every structural read and write.
//! - **point / line creation guards**: serialize landmark creation. They are
//!   taken and released before the map-update lock and never held together
//!   with it, so the two can not deadlock.
//! - `change_index` / `last_notified_change` are atomics bumped while the
//!   mutating write guard is still held.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use nalgebra::{Matrix3, Vector3};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::atlas::ids::IdRegistry;
use crate::atlas::keyframe_db::{KeyFrameDatabase, Vocabulary};
use crate::camera::CameraModel;
use crate::error::MapError;
use crate::geometry::{SE3, Sim3};

use super::graph::MapGraph;
use super::keyframe::KeyFrame;
use super::map_line::{LineDescriptor, MapLine};
use super::map_point::{MapPoint, OrbDescriptor};
use super::semantic::SemanticLayer;
use super::snapshot::{MapEntities, MapSnapshot, PostLoadReport, SNAPSHOT_VERSION};
use super::types::{CameraId, KeyFrameId, MapId, MapLineId, MapPointId};

/// Thumbnail size in pixels (always a power of 2).
pub const THUMB_WIDTH: u32 = 512;
pub const THUMB_HEIGHT: u32 = 512;

const DEFAULT_SCALE_FACTOR: f64 = 1.2;
const DEFAULT_NUM_LEVELS: u32 = 8;

/// Lifecycle of a map inside the atlas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    /// Created, never made current.
    Empty,
    /// The live map being built.
    Active,
    /// Parked by the atlas.
    Stored,
    /// Excluded from all future use.
    Bad,
}

#[derive(Debug, Default)]
struct MapFlags {
    in_use: bool,
    stored: bool,
    bad: bool,
    fail: bool,
    thumbnail: Option<Vec<u8>>,
}

pub struct Map {
    id: AtomicU64,

    /// Map-update lock.
    graph: RwLock<MapGraph>,

    point_creation: Mutex<()>,
    line_creation: Mutex<()>,

    change_index: AtomicI64,
    last_notified_change: AtomicI64,

    flags: Mutex<MapFlags>,

    /// Header of a loaded snapshot until `post_load` resolves it.
    backup: Mutex<Option<MapSnapshot>>,

    semantic: SemanticLayer,

    registry: Arc<IdRegistry>,
}

impl Map {
    /// Create an empty map whose first keyframe will come from the
    /// registry's next keyframe id.
    pub fn new(registry: Arc<IdRegistry>) -> Self {
        let init_kf_id = registry.keyframes.peek();
        Self::with_params(registry, init_kf_id, DEFAULT_SCALE_FACTOR, DEFAULT_NUM_LEVELS)
    }

    /// Create an empty map with explicit initial keyframe id and pyramid
    /// parameters (used for landmark distance bounds).
    pub fn with_params(registry: Arc<IdRegistry>, init_kf_id: u64, scale_factor: f64, num_levels: u32) -> Self {
        let id = registry.next_map_id();
        info!(map = %id, init_kf_id, "created map");
        Self {
            id: AtomicU64::new(id.0),
            graph: RwLock::new(MapGraph::new(init_kf_id, scale_factor, num_levels)),
            point_creation: Mutex::new(()),
            line_creation: Mutex::new(()),
            change_index: AtomicI64::new(0),
            last_notified_change: AtomicI64::new(0),
            flags: Mutex::new(MapFlags::default()),
            backup: Mutex::new(None),
            semantic: SemanticLayer::new(),
            registry,
        }
    }

    /// Rebuild the scalar state of a saved map. Entities are restored by a
    /// following call to [`post_load`](Self::post_load).
    pub fn from_snapshot(snapshot: MapSnapshot, registry: Arc<IdRegistry>) -> Self {
        registry.maps.advance_past(snapshot.map_id.0);

        let mut graph = MapGraph::new(snapshot.init_kf_id, snapshot.scale_factor, snapshot.num_levels);
        graph.max_kf_id = snapshot.max_kf_id;
        graph.last_loop_kf_id = snapshot.last_loop_kf_id;
        graph.big_change_index = snapshot.big_change_index;
        graph.imu_initialized = snapshot.imu_initialized;
        graph.is_inertial = snapshot.is_inertial;
        graph.inertial_ba1 = snapshot.inertial_ba1;
        graph.inertial_ba2 = snapshot.inertial_ba2;
        graph.initial_kf = snapshot.initial_kf_id;
        graph.lower_kf = snapshot.lower_kf_id;

        let flags = MapFlags {
            stored: true,
            thumbnail: snapshot.thumbnail.clone(),
            ..MapFlags::default()
        };

        Self {
            id: AtomicU64::new(snapshot.map_id.0),
            graph: RwLock::new(graph),
            point_creation: Mutex::new(()),
            line_creation: Mutex::new(()),
            change_index: AtomicI64::new(0),
            last_notified_change: AtomicI64::new(0),
            flags: Mutex::new(flags),
            backup: Mutex::new(Some(snapshot)),
            semantic: SemanticLayer::new(),
            registry,
        }
    }

    pub fn id(&self) -> MapId {
        MapId::new(self.id.load(Ordering::SeqCst))
    }

    /// Reassign this map's id. Uniqueness across maps is enforced by the
    /// atlas, see [`Atlas::change_map_id`](crate::atlas::Atlas::change_map_id).
    pub fn change_id(&self, new_id: MapId) {
        let old = self.id.swap(new_id.0, Ordering::SeqCst);
        self.registry.maps.advance_past(new_id.0);
        info!(from = old, to = %new_id, "map id changed");
    }

    pub fn registry(&self) -> &Arc<IdRegistry> {
        &self.registry
    }

    pub fn semantic(&self) -> &SemanticLayer {
        &self.semantic
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Locking
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `f` under the map-update lock. Counts as one structural change.
    pub fn with_update_lock<R>(&self, f: impl FnOnce(&mut MapGraph) -> R) -> R {
        let mut graph = self.graph.write();
        let result = f(&mut graph);
        self.change_index.fetch_add(1, Ordering::SeqCst);
        result
    }

    /// Run `f` with shared access to the graph.
    pub fn read<R>(&self, f: impl FnOnce(&MapGraph) -> R) -> R {
        f(&self.graph.read())
    }

    /// Hold off point creation, e.g. while an optimizer snapshots landmarks.
    ///
    /// Do not call [`create_map_point`](Self::create_map_point) while the
    /// guard is alive.
    pub fn lock_point_creation(&self) -> MutexGuard<'_, ()> {
        self.point_creation.lock()
    }

    pub fn lock_line_creation(&self) -> MutexGuard<'_, ()> {
        self.line_creation.lock()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Insertion and Removal
    // ─────────────────────────────────────────────────────────────────────────

    /// Add an existing keyframe. Re-adding a present id is a no-op.
    pub fn add_keyframe(&self, kf: KeyFrame) -> bool {
        self.with_update_lock(|graph| graph.add_keyframe(kf))
    }

    pub fn add_map_point(&self, mp: MapPoint) -> bool {
        self.with_update_lock(|graph| graph.add_map_point(mp))
    }

    pub fn add_map_line(&self, ml: MapLine) -> bool {
        self.with_update_lock(|graph| graph.add_map_line(ml))
    }

    /// Allocate an id, create a keyframe and link it after the previous one.
    pub fn create_keyframe(
        &self,
        timestamp_ns: u64,
        pose: SE3,
        num_points: usize,
        num_lines: usize,
    ) -> Result<KeyFrameId, MapError> {
        let id = self.registry.next_keyframe_id();
        let kf = KeyFrame::new(id, timestamp_ns, pose, num_points, num_lines);
        self.with_update_lock(|graph| graph.insert_new_keyframe(kf))
    }

    /// Allocate an id and create a MapPoint.
    pub fn create_map_point(
        &self,
        position: Vector3<f64>,
        descriptor: OrbDescriptor,
        first_kf_id: KeyFrameId,
    ) -> Result<MapPointId, MapError> {
        let mp = {
            let _creation = self.point_creation.lock();
            MapPoint::new(self.registry.next_map_point_id(), position, descriptor, first_kf_id)
        };
        self.with_update_lock(|graph| graph.insert_new_map_point(mp))
    }

    /// Allocate an id and create a MapLine.
    pub fn create_map_line(
        &self,
        start: Vector3<f64>,
        end: Vector3<f64>,
        descriptor: LineDescriptor,
        first_kf_id: KeyFrameId,
    ) -> Result<MapLineId, MapError> {
        let ml = {
            let _creation = self.line_creation.lock();
            MapLine::new(self.registry.next_map_line_id(), start, end, descriptor, first_kf_id)
        };
        self.with_update_lock(|graph| graph.insert_new_map_line(ml))
    }

    /// Remove a keyframe. Back-references held by other entities are left
    /// in place; origin, initial and lowest ids are still remembered and an
    /// origin keyframe is retired as bad instead of removed.
    pub fn erase_keyframe(&self, id: KeyFrameId) -> bool {
        self.with_update_lock(|graph| graph.erase_keyframe(id))
    }

    pub fn erase_map_point(&self, id: MapPointId) -> bool {
        self.with_update_lock(|graph| graph.erase_map_point(id).is_some())
    }

    pub fn erase_map_line(&self, id: MapLineId) -> bool {
        self.with_update_lock(|graph| graph.erase_map_line(id).is_some())
    }

    /// Wipe every entity and the semantic layer. The initial keyframe id,
    /// the big change index and the inertial sensor latch survive; IMU
    /// initialization is reset.
    pub fn clear(&self) {
        self.with_update_lock(MapGraph::clear);
        self.semantic.clear();
        info!(map = %self.id(), "map cleared");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reference Sets
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the local-mapping reference points wholesale.
    pub fn set_reference_map_points(&self, ids: Vec<MapPointId>) {
        self.graph.write().reference_map_points = ids;
    }

    pub fn set_reference_map_lines(&self, ids: Vec<MapLineId>) {
        self.graph.write().reference_map_lines = ids;
    }

    pub fn reference_map_points(&self) -> Vec<MapPointId> {
        self.graph.read().reference_map_points.clone()
    }

    pub fn reference_map_lines(&self) -> Vec<MapLineId> {
        self.graph.read().reference_map_lines.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change Tracking
    // ─────────────────────────────────────────────────────────────────────────

    /// Signal a global correction (loop closure, global BA).
    pub fn inform_new_big_change(&self) {
        let mut graph = self.graph.write();
        graph.big_change_index += 1;
        self.change_index.fetch_add(1, Ordering::SeqCst);
    }

    pub fn last_big_change_index(&self) -> u64 {
        self.graph.read().big_change_index
    }

    pub fn map_change_index(&self) -> i64 {
        self.change_index.load(Ordering::SeqCst)
    }

    pub fn increase_change_index(&self) {
        self.change_index.fetch_add(1, Ordering::SeqCst);
    }

    pub fn last_map_change(&self) -> i64 {
        self.last_notified_change.load(Ordering::SeqCst)
    }

    pub fn set_last_map_change(&self, change: i64) {
        self.last_notified_change.store(change, Ordering::SeqCst);
    }

    /// True if the map changed since the last [`set_last_map_change`](Self::set_last_map_change).
    pub fn has_unseen_changes(&self) -> bool {
        self.map_change_index() > self.last_map_change()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn all_keyframes(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<_> = self.graph.read().keyframe_ids().collect();
        ids.sort();
        ids
    }

    pub fn all_map_points(&self) -> Vec<MapPointId> {
        let mut ids: Vec<_> = self.graph.read().map_points.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn all_map_lines(&self) -> Vec<MapLineId> {
        let mut ids: Vec<_> = self.graph.read().map_lines.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<KeyFrame> {
        self.graph.read().keyframe(id).cloned()
    }

    pub fn map_point(&self, id: MapPointId) -> Option<MapPoint> {
        self.graph.read().map_point(id).cloned()
    }

    pub fn map_line(&self, id: MapLineId) -> Option<MapLine> {
        self.graph.read().map_line(id).cloned()
    }

    /// Mutate one keyframe in place. Returns `None` if it is not in the map.
    pub fn update_keyframe<R>(&self, id: KeyFrameId, f: impl FnOnce(&mut KeyFrame) -> R) -> Option<R> {
        self.with_update_lock(|graph| graph.keyframe_mut(id).map(f))
    }

    pub fn update_map_point<R>(&self, id: MapPointId, f: impl FnOnce(&mut MapPoint) -> R) -> Option<R> {
        self.with_update_lock(|graph| graph.map_point_mut(id).map(f))
    }

    pub fn update_map_line<R>(&self, id: MapLineId, f: impl FnOnce(&mut MapLine) -> R) -> Option<R> {
        self.with_update_lock(|graph| graph.map_line_mut(id).map(f))
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.graph.read().num_keyframes()
    }

    pub fn map_points_in_map(&self) -> usize {
        self.graph.read().num_map_points()
    }

    pub fn map_lines_in_map(&self) -> usize {
        self.graph.read().num_map_lines()
    }

    pub fn init_kf_id(&self) -> u64 {
        self.graph.read().init_kf_id
    }

    pub fn set_init_kf_id(&self, id: u64) {
        self.graph.write().init_kf_id = id;
    }

    pub fn max_kf_id(&self) -> u64 {
        self.graph.read().max_kf_id
    }

    pub fn last_loop_kf_id(&self) -> u64 {
        self.graph.read().last_loop_kf_id
    }

    pub fn set_last_loop_kf_id(&self, id: u64) {
        self.graph.write().last_loop_kf_id = id;
    }

    /// First origin of the essential graph.
    pub fn origin_keyframe(&self) -> Option<KeyFrameId> {
        self.graph.read().keyframe_origins.first().copied()
    }

    pub fn origin_keyframes(&self) -> Vec<KeyFrameId> {
        self.graph.read().keyframe_origins.clone()
    }

    /// Register an additional origin (e.g. after merging a map).
    pub fn add_origin_keyframe(&self, id: KeyFrameId) {
        let mut graph = self.graph.write();
        if !graph.keyframe_origins.contains(&id) {
            graph.keyframe_origins.push(id);
        }
    }

    pub fn initial_keyframe_id(&self) -> Option<KeyFrameId> {
        self.graph.read().initial_kf
    }

    pub fn lower_keyframe_id(&self) -> Option<KeyFrameId> {
        self.graph.read().lower_kf
    }

    pub fn first_region_keyframe(&self) -> Option<KeyFrameId> {
        self.graph.read().first_region_kf
    }

    pub fn set_first_region_keyframe(&self, id: KeyFrameId) {
        self.graph.write().first_region_kf = Some(id);
    }

    pub fn last_keyframe_id(&self) -> Option<KeyFrameId> {
        self.graph.read().last_keyframe_id
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Graph Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    pub fn associate_point(&self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        self.with_update_lock(|graph| graph.associate_point(kf_id, feature_idx, mp_id))
    }

    pub fn associate_line(&self, kf_id: KeyFrameId, feature_idx: usize, ml_id: MapLineId) -> bool {
        self.with_update_lock(|graph| graph.associate_line(kf_id, feature_idx, ml_id))
    }

    pub fn disassociate_point(&self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        self.with_update_lock(|graph| graph.disassociate_point(kf_id, feature_idx))
    }

    pub fn disassociate_line(&self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapLineId> {
        self.with_update_lock(|graph| graph.disassociate_line(kf_id, feature_idx))
    }

    pub fn set_spanning_parent(&self, child: KeyFrameId, parent: KeyFrameId) -> bool {
        self.with_update_lock(|graph| graph.set_spanning_parent(child, parent))
    }

    pub fn add_loop_edge(&self, a: KeyFrameId, b: KeyFrameId) -> bool {
        self.with_update_lock(|graph| graph.add_loop_edge(a, b))
    }

    /// The `n` keyframes sharing the most landmarks with `kf_id`.
    pub fn local_keyframes(&self, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
        // Takes the write side: the ordered covisibility cache may be rebuilt.
        self.graph.write().local_keyframes(kf_id, n)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Global Corrections
    // ─────────────────────────────────────────────────────────────────────────

    /// Rotate the whole map: `T_yc = R_yw * T_wc`, landmarks `R_yw * p`.
    pub fn rotate_map(&self, r_yw: &Matrix3<f64>) {
        self.apply_scaled_rotation(r_yw, 1.0, false, Vector3::zeros());
    }

    /// Apply `p' = s * R * p + t` to every pose and landmark.
    ///
    /// Camera centres move with the landmarks while orientations only pick up
    /// `R`. Velocities are rotated, and scaled by `s` if `scale_velocity`.
    pub fn apply_scaled_rotation(&self, r: &Matrix3<f64>, s: f64, scale_velocity: bool, t: Vector3<f64>) {
        let correction = Sim3::from_rts(r, t, s);
        let mut graph = self.graph.write();
        graph.apply_similarity(&correction, scale_velocity);
        graph.big_change_index += 1;
        self.change_index.fetch_add(1, Ordering::SeqCst);
        info!(
            map = %self.id(),
            scale = s,
            big_change = graph.big_change_index,
            "applied scaled rotation"
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inertial State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_inertial_sensor(&self) {
        self.graph.write().is_inertial = true;
    }

    pub fn is_inertial(&self) -> bool {
        self.graph.read().is_inertial
    }

    pub fn set_imu_initialized(&self) {
        self.graph.write().imu_initialized = true;
    }

    pub fn is_imu_initialized(&self) -> bool {
        self.graph.read().imu_initialized
    }

    /// Mark the first visual-inertial BA as done.
    pub fn set_inertial_ba1(&self) {
        self.graph.write().inertial_ba1 = true;
    }

    pub fn is_inertial_ba1(&self) -> bool {
        self.graph.read().inertial_ba1
    }

    /// Mark the second visual-inertial BA as done.
    pub fn set_inertial_ba2(&self) {
        self.graph.write().inertial_ba2 = true;
    }

    pub fn is_inertial_ba2(&self) -> bool {
        self.graph.read().inertial_ba2
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Essential Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Check that every live keyframe has a path to an origin keyframe.
    pub fn check_essential_graph(&self) -> Result<(), MapError> {
        let result = self.graph.read().check_essential_graph();
        if let Err(err) = &result {
            warn!(map = %self.id(), %err, "essential graph check failed");
        }
        result
    }

    /// Log the spanning tree under each origin and return the dump.
    pub fn print_essential_graph(&self) -> String {
        let report = self.graph.read().essential_graph_report();
        info!(map = %self.id(), "\n{report}");
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    pub fn status(&self) -> MapStatus {
        let flags = self.flags.lock();
        if flags.bad {
            MapStatus::Bad
        } else if flags.in_use {
            MapStatus::Active
        } else if flags.stored {
            MapStatus::Stored
        } else {
            MapStatus::Empty
        }
    }

    pub fn set_current_map(&self) {
        let mut flags = self.flags.lock();
        if flags.bad {
            warn!(map = %self.id(), "ignoring set_current_map on a bad map");
            return;
        }
        flags.in_use = true;
        flags.stored = false;
        debug!(map = %self.id(), "map is current");
    }

    pub fn set_stored_map(&self) {
        let mut flags = self.flags.lock();
        if flags.bad {
            warn!(map = %self.id(), "ignoring set_stored_map on a bad map");
            return;
        }
        flags.in_use = false;
        flags.stored = true;
        debug!(map = %self.id(), "map stored");
    }

    pub fn is_in_use(&self) -> bool {
        self.flags.lock().in_use
    }

    /// Mark the whole map unusable. Terminal.
    pub fn set_bad(&self) {
        let mut flags = self.flags.lock();
        if !flags.bad {
            flags.bad = true;
            flags.in_use = false;
            info!(map = %self.id(), "map marked bad");
        }
    }

    pub fn is_bad(&self) -> bool {
        self.flags.lock().bad
    }

    pub fn set_fail(&self, fail: bool) {
        self.flags.lock().fail = fail;
    }

    pub fn is_fail(&self) -> bool {
        self.flags.lock().fail
    }

    /// Store a rendered `THUMB_WIDTH x THUMB_HEIGHT` preview.
    pub fn set_thumbnail(&self, thumbnail: Vec<u8>) {
        self.flags.lock().thumbnail = Some(thumbnail);
    }

    pub fn has_thumbnail(&self) -> bool {
        self.flags.lock().thumbnail.is_some()
    }

    pub fn thumbnail(&self) -> Option<Vec<u8>> {
        self.flags.lock().thumbnail.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Save / Restore
    // ─────────────────────────────────────────────────────────────────────────

    /// Keyframes that survive a save: live ones plus origins.
    fn saved_keyframe_ids(graph: &MapGraph) -> HashSet<KeyFrameId> {
        graph
            .keyframes()
            .filter(|kf| !kf.is_bad || graph.keyframe_origins.contains(&kf.id))
            .map(|kf| kf.id)
            .collect()
    }

    /// Build the persisted header and the entities it lists, and collect
    /// the cameras the saved keyframes use into `cameras`.
    ///
    /// Both parts come from one hold of the map-update lock. Links to
    /// dropped entities are removed from the exported copies.
    pub fn pre_save(&self, cameras: &mut BTreeSet<CameraId>) -> (MapSnapshot, MapEntities) {
        let graph = self.graph.write();

        let kept_kfs = Self::saved_keyframe_ids(&graph);
        let kept_mps: HashSet<MapPointId> = graph
            .map_points
            .values()
            .filter(|mp| !mp.is_bad)
            .map(|mp| mp.id)
            .collect();
        let kept_mls: HashSet<MapLineId> = graph
            .map_lines
            .values()
            .filter(|ml| !ml.is_bad)
            .map(|ml| ml.id)
            .collect();

        let mut keyframe_ids: Vec<_> = kept_kfs.iter().copied().collect();
        keyframe_ids.sort();
        let mut map_point_ids: Vec<_> = kept_mps.iter().copied().collect();
        map_point_ids.sort();
        let mut map_line_ids: Vec<_> = kept_mls.iter().copied().collect();
        map_line_ids.sort();

        let mut camera_ids = BTreeSet::new();
        for id in &keyframe_ids {
            if let Some(cam) = graph.keyframe(*id).and_then(|kf| kf.camera_id) {
                camera_ids.insert(cam);
            }
        }
        cameras.extend(camera_ids.iter().copied());

        let snapshot = MapSnapshot {
            version: SNAPSHOT_VERSION,
            map_id: self.id(),
            init_kf_id: graph.init_kf_id,
            max_kf_id: graph.max_kf_id,
            last_loop_kf_id: graph.last_loop_kf_id,
            big_change_index: graph.big_change_index,
            keyframe_ids,
            map_point_ids,
            map_line_ids,
            origin_ids: graph
                .keyframe_origins
                .iter()
                .copied()
                .filter(|id| kept_kfs.contains(id))
                .collect(),
            lower_kf_id: graph.lower_kf,
            initial_kf_id: graph.initial_kf,
            imu_initialized: graph.imu_initialized,
            is_inertial: graph.is_inertial,
            inertial_ba1: graph.inertial_ba1,
            inertial_ba2: graph.inertial_ba2,
            camera_ids: camera_ids.into_iter().collect(),
            scale_factor: graph.scale_factor,
            num_levels: graph.num_levels,
            thumbnail: self.thumbnail(),
        };

        let keyframes = kept_kfs
            .iter()
            .filter_map(|id| graph.keyframe(*id))
            .map(|kf| {
                let mut kf = kf.clone();
                kf.retain_references(
                    |id| kept_kfs.contains(&id),
                    |id| kept_mps.contains(&id),
                    |id| kept_mls.contains(&id),
                );
                (kf.id, kf)
            })
            .collect();

        let map_points = kept_mps
            .iter()
            .filter_map(|id| graph.map_point(*id))
            .map(|mp| {
                let mut mp = mp.clone();
                mp.observations.retain(|kf_id, _| kept_kfs.contains(kf_id));
                (mp.id, mp)
            })
            .collect();

        let map_lines = kept_mls
            .iter()
            .filter_map(|id| graph.map_line(*id))
            .map(|ml| {
                let mut ml = ml.clone();
                ml.observations.retain(|kf_id, _| kept_kfs.contains(kf_id));
                (ml.id, ml)
            })
            .collect();

        info!(
            map = %snapshot.map_id,
            keyframes = snapshot.keyframe_ids.len(),
            map_points = snapshot.map_point_ids.len(),
            map_lines = snapshot.map_line_ids.len(),
            "map prepared for saving"
        );
        (
            snapshot,
            MapEntities {
                keyframes,
                map_points,
                map_lines,
            },
        )
    }

    /// Restore entities after [`from_snapshot`](Self::from_snapshot).
    ///
    /// Ids listed in the snapshot but absent from `entities` are skipped
    /// with a warning, as are links to them and unknown cameras. Origin,
    /// initial and lowest keyframe ids without a restored keyframe are
    /// cleared. Keyframes
    /// without a BoW vector get one from `vocabulary`; every restored
    /// keyframe is indexed in `keyframe_db`.
    pub fn post_load(
        &self,
        keyframe_db: &mut KeyFrameDatabase,
        vocabulary: &dyn Vocabulary,
        entities: &MapEntities,
        cameras: &HashMap<CameraId, CameraModel>,
    ) -> PostLoadReport {
        let mut report = PostLoadReport::default();
        let map_id = self.id();

        let Some(backup) = self.backup.lock().take() else {
            warn!(map = %map_id, "post_load called without a pending snapshot");
            return report;
        };

        let mut graph = self.graph.write();

        for id in &backup.map_point_ids {
            match entities.map_points.get(id) {
                Some(mp) => {
                    graph.add_map_point(mp.clone());
                }
                None => {
                    warn!(map = %map_id, map_point = %id, "saved map point not found");
                    report.missing_map_points += 1;
                }
            }
        }
        for id in &backup.map_line_ids {
            match entities.map_lines.get(id) {
                Some(ml) => {
                    graph.add_map_line(ml.clone());
                }
                None => {
                    warn!(map = %map_id, map_line = %id, "saved map line not found");
                    report.missing_map_lines += 1;
                }
            }
        }
        for id in &backup.keyframe_ids {
            match entities.keyframes.get(id) {
                Some(kf) => {
                    graph.keyframes.insert(*id, kf.clone());
                }
                None => {
                    warn!(map = %map_id, keyframe = %id, "saved keyframe not found");
                    report.missing_keyframes += 1;
                }
            }
        }

        let kf_ids: HashSet<KeyFrameId> = graph.keyframes.keys().copied().collect();
        let mp_ids: HashSet<MapPointId> = graph.map_points.keys().copied().collect();
        let ml_ids: HashSet<MapLineId> = graph.map_lines.keys().copied().collect();

        for kf in graph.keyframes.values_mut() {
            report.dropped_references += kf.retain_references(
                |id| kf_ids.contains(&id),
                |id| mp_ids.contains(&id),
                |id| ml_ids.contains(&id),
            );

            if let Some(cam) = kf.camera_id {
                if !cameras.contains_key(&cam) {
                    warn!(map = %map_id, keyframe = %kf.id, camera = %cam, "camera not found");
                    kf.camera_id = None;
                    report.unresolved_cameras += 1;
                }
            }

            let bow = match &kf.bow_vector {
                Some(bow) => bow.clone(),
                None => {
                    let bow = vocabulary.transform(&kf.descriptors);
                    kf.bow_vector = Some(bow.clone());
                    report.bow_recomputed += 1;
                    bow
                }
            };
            keyframe_db.add(kf.id, bow, map_id);
        }
        for mp in graph.map_points.values_mut() {
            let before = mp.observations.len();
            mp.observations.retain(|kf_id, _| kf_ids.contains(kf_id));
            report.dropped_references += before - mp.observations.len();
        }
        for ml in graph.map_lines.values_mut() {
            let before = ml.observations.len();
            ml.observations.retain(|kf_id, _| kf_ids.contains(kf_id));
            report.dropped_references += before - ml.observations.len();
        }

        for id in &backup.origin_ids {
            if kf_ids.contains(id) {
                graph.keyframe_origins.push(*id);
            } else {
                warn!(map = %map_id, keyframe = %id, "saved origin keyframe not found");
                report.unresolved_backbone += 1;
            }
        }
        let graph_ref = &mut *graph;
        for (role, slot) in [("initial", &mut graph_ref.initial_kf), ("lowest", &mut graph_ref.lower_kf)] {
            if let Some(id) = slot.filter(|id| !kf_ids.contains(id)) {
                warn!(map = %map_id, keyframe = %id, role, "saved backbone keyframe not found");
                *slot = None;
                report.unresolved_backbone += 1;
            }
        }
        graph.last_keyframe_id = kf_ids.iter().max().copied();

        if let Some(max) = kf_ids.iter().max() {
            self.registry.keyframes.advance_past(max.0);
            graph.max_kf_id = graph.max_kf_id.max(max.0);
        }
        if let Some(max) = mp_ids.iter().max() {
            self.registry.map_points.advance_past(max.0);
        }
        if let Some(max) = ml_ids.iter().max() {
            self.registry.map_lines.advance_past(max.0);
        }

        report.keyframes = kf_ids.len();
        report.map_points = mp_ids.len();
        report.map_lines = ml_ids.len();
        self.change_index.fetch_add(1, Ordering::SeqCst);

        info!(
            map = %map_id,
            keyframes = report.keyframes,
            map_points = report.map_points,
            map_lines = report.map_lines,
            dropped_references = report.dropped_references,
            "map restored"
        );
        report
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("graph", &*self.graph.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::keyframe_db::BowVector;
    use approx::assert_relative_eq;
    use rand::seq::SliceRandom;
    use std::thread;

    struct WordCountVocabulary;

    impl Vocabulary for WordCountVocabulary {
        fn transform(&self, descriptors: &[OrbDescriptor]) -> BowVector {
            let mut bow = BowVector::new();
            for d in descriptors {
                *bow.entry(d[0] as u32).or_insert(0.0) += 1.0;
            }
            bow
        }
    }

    fn create_test_map() -> Map {
        Map::new(IdRegistry::new())
    }

    fn add_keyframes(map: &Map, n: usize) -> Vec<KeyFrameId> {
        (0..n)
            .map(|i| map.create_keyframe(i as u64 * 1000, SE3::identity(), 10, 10).unwrap())
            .collect()
    }

    #[test]
    fn test_create_ids_unique_across_threads() {
        let map = create_test_map();
        let kf = add_keyframes(&map, 1)[0];

        let ids: Vec<(Vec<MapPointId>, Vec<MapLineId>)> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let mut points = Vec::new();
                        let mut lines = Vec::new();
                        for _ in 0..200 {
                            points.push(map.create_map_point(Vector3::zeros(), [0; 32], kf).unwrap());
                            lines.push(
                                map.create_map_line(Vector3::zeros(), Vector3::x(), [0; 32], kf)
                                    .unwrap(),
                            );
                        }
                        (points, lines)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let points: HashSet<_> = ids.iter().flat_map(|(p, _)| p.iter().copied()).collect();
        let lines: HashSet<_> = ids.iter().flat_map(|(_, l)| l.iter().copied()).collect();
        assert_eq!(points.len(), 1600);
        assert_eq!(lines.len(), 1600);
        assert_eq!(map.map_points_in_map(), 1600);
        assert_eq!(map.map_lines_in_map(), 1600);
    }

    #[test]
    fn test_duplicate_create_is_rejected() {
        let map = create_test_map();
        let next = map.registry().map_points.peek();
        map.add_map_point(MapPoint::new(MapPointId::new(next), Vector3::zeros(), [0; 32], KeyFrameId::new(0)));

        let err = map
            .create_map_point(Vector3::zeros(), [0; 32], KeyFrameId::new(0))
            .unwrap_err();
        assert!(matches!(err, MapError::DuplicateId { kind: "map point", .. }));
    }

    #[test]
    fn test_add_is_idempotent() {
        let map = create_test_map();
        let mp = MapPoint::new(MapPointId::new(3), Vector3::zeros(), [0; 32], KeyFrameId::new(0));
        assert!(map.add_map_point(mp.clone()));
        assert!(!map.add_map_point(mp));
        assert_eq!(map.map_points_in_map(), 1);
    }

    #[test]
    fn test_shuffled_keyframe_insertion() {
        let map = create_test_map();
        let mut ids: Vec<u64> = (10..40).collect();
        ids.shuffle(&mut rand::thread_rng());

        for id in &ids {
            map.add_keyframe(KeyFrame::new(KeyFrameId::new(*id), 0, SE3::identity(), 0, 0));
        }

        assert_eq!(map.keyframes_in_map(), 30);
        assert_eq!(map.max_kf_id(), 39);
        assert_eq!(map.lower_keyframe_id(), Some(KeyFrameId::new(10)));
        assert_eq!(map.origin_keyframe(), Some(KeyFrameId::new(ids[0])));
        assert_eq!(map.init_kf_id(), ids[0]);
    }

    #[test]
    fn test_erase_keeps_origin_and_lower() {
        let map = create_test_map();
        let kfs = add_keyframes(&map, 3);
        map.set_spanning_parent(kfs[1], kfs[0]);
        map.set_spanning_parent(kfs[2], kfs[1]);
        assert!(map.check_essential_graph().is_ok());

        assert!(map.erase_keyframe(kfs[0]));
        assert!(!map.erase_keyframe(kfs[0]));
        assert_eq!(map.origin_keyframe(), Some(kfs[0]));
        assert_eq!(map.lower_keyframe_id(), Some(kfs[0]));
        assert_eq!(map.initial_keyframe_id(), Some(kfs[0]));
        assert!(map.keyframe(kfs[0]).unwrap().is_bad);
        assert!(map.check_essential_graph().is_ok());

        assert!(map.erase_keyframe(kfs[2]));
        assert_eq!(map.all_keyframes(), vec![kfs[0], kfs[1]]);
    }

    #[test]
    fn test_big_change_monotonic_across_threads() {
        let map = create_test_map();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let mut last = 0;
                    for _ in 0..250 {
                        map.inform_new_big_change();
                        let now = map.last_big_change_index();
                        assert!(now >= last);
                        last = now;
                    }
                });
            }
        });

        assert_eq!(map.last_big_change_index(), 1000);
    }

    #[test]
    fn test_reference_replacement_is_atomic() {
        let map = create_test_map();
        let set_a: Vec<MapPointId> = (0..50).map(MapPointId::new).collect();
        let set_b: Vec<MapPointId> = (100..150).map(MapPointId::new).collect();
        map.set_reference_map_points(set_a.clone());

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..500 {
                    let next = if i % 2 == 0 { set_b.clone() } else { set_a.clone() };
                    map.set_reference_map_points(next);
                }
            });
            for _ in 0..3 {
                s.spawn(|| {
                    for _ in 0..500 {
                        let seen = map.reference_map_points();
                        assert!(seen == set_a || seen == set_b, "torn reference set");
                    }
                });
            }
        });
    }

    #[test]
    fn test_change_index_tracks_mutations() {
        let map = create_test_map();
        assert!(!map.has_unseen_changes());

        add_keyframes(&map, 1);
        assert!(map.has_unseen_changes());

        map.set_last_map_change(map.map_change_index());
        assert!(!map.has_unseen_changes());

        map.increase_change_index();
        assert!(map.has_unseen_changes());
    }

    #[test]
    fn test_apply_scaled_rotation_is_big_change() {
        let map = create_test_map();
        let kf = add_keyframes(&map, 1)[0];
        let mp = map.create_map_point(Vector3::new(1.0, 0.0, 0.0), [0; 32], kf).unwrap();
        let ml = map
            .create_map_line(Vector3::new(1.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 0.0), [0; 32], kf)
            .unwrap();
        map.update_keyframe(kf, |kf| kf.velocity = Vector3::new(1.0, 0.0, 0.0));
        let before = map.map_change_index();

        let r = *nalgebra::Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2).matrix();
        map.apply_scaled_rotation(&r, 2.0, false, Vector3::new(0.0, 0.0, 1.0));

        assert_eq!(map.last_big_change_index(), 1);
        assert!(map.map_change_index() > before);
        assert_relative_eq!(map.map_point(mp).unwrap().position, Vector3::new(0.0, 2.0, 1.0), epsilon = 1e-12);
        let line = map.map_line(ml).unwrap();
        assert_relative_eq!(line.end, Vector3::new(-2.0, 2.0, 1.0), epsilon = 1e-12);
        // Rotated but not scaled
        assert_relative_eq!(map.keyframe(kf).unwrap().velocity, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);

        map.rotate_map(&r.transpose());
        assert_eq!(map.last_big_change_index(), 2);
        assert_relative_eq!(map.map_point(mp).unwrap().position, Vector3::new(2.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_inertial_latches() {
        let map = create_test_map();
        assert!(!map.is_inertial() && !map.is_imu_initialized());
        map.set_inertial_sensor();
        map.set_imu_initialized();
        map.set_inertial_ba1();
        assert!(map.is_inertial() && map.is_imu_initialized() && map.is_inertial_ba1());
        assert!(!map.is_inertial_ba2());
        map.set_inertial_ba2();
        assert!(map.is_inertial_ba2());
    }

    #[test]
    fn test_status_machine() {
        let map = create_test_map();
        assert_eq!(map.status(), MapStatus::Empty);

        map.set_current_map();
        assert_eq!(map.status(), MapStatus::Active);
        assert!(map.is_in_use());

        map.set_stored_map();
        assert_eq!(map.status(), MapStatus::Stored);
        map.set_current_map();
        assert_eq!(map.status(), MapStatus::Active);

        map.set_bad();
        assert_eq!(map.status(), MapStatus::Bad);
        map.set_current_map();
        assert_eq!(map.status(), MapStatus::Bad);
        assert!(!map.is_in_use());
    }

    #[test]
    fn test_essential_graph_via_store() {
        let map = create_test_map();
        let kfs = add_keyframes(&map, 3);
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 3.0), [0; 32], kfs[0]).unwrap();
        map.associate_point(kfs[0], 0, mp);
        map.associate_point(kfs[1], 0, mp);

        assert!(matches!(
            map.check_essential_graph(),
            Err(MapError::DisconnectedKeyFrames { .. })
        ));
        assert!(map.print_essential_graph().contains("disconnected"));

        map.erase_keyframe(kfs[2]);
        assert!(map.check_essential_graph().is_ok());
    }

    /// Build a small map with two keyframes sharing a point and a line, plus
    /// one bad landmark that must not survive saving.
    fn populated_map(registry: Arc<IdRegistry>) -> (Map, Vec<KeyFrameId>) {
        let map = Map::new(registry);
        map.set_current_map();
        let kfs = add_keyframes(&map, 2);
        for kf in &kfs {
            map.update_keyframe(*kf, |kf| {
                kf.camera_id = Some(CameraId::new(0));
                kf.descriptors = vec![[1; 32], [2; 32]];
            });
        }
        map.set_spanning_parent(kfs[1], kfs[0]);

        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), [7; 32], kfs[0]).unwrap();
        let bad = map.create_map_point(Vector3::new(0.0, 1.0, 4.0), [8; 32], kfs[0]).unwrap();
        let ml = map
            .create_map_line(Vector3::new(0.0, 0.0, 4.0), Vector3::new(1.0, 0.0, 4.0), [9; 32], kfs[0])
            .unwrap();
        for kf in &kfs {
            map.associate_point(*kf, 0, mp);
            map.associate_line(*kf, 0, ml);
        }
        map.associate_point(kfs[1], 1, bad);
        map.update_map_point(bad, |mp| mp.set_bad());

        map.set_inertial_sensor();
        map.set_imu_initialized();
        map.set_inertial_ba1();
        map.inform_new_big_change();
        (map, kfs)
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let (map, kfs) = populated_map(IdRegistry::new());

        let mut cameras = BTreeSet::new();
        let (snapshot, entities) = map.pre_save(&mut cameras);
        assert_eq!(cameras.into_iter().collect::<Vec<_>>(), vec![CameraId::new(0)]);
        assert_eq!(snapshot.map_point_ids.len(), 1);

        let mut buf = Vec::new();
        snapshot.write_to(&mut buf).unwrap();
        let encoded_entities = bincode::serialize(&entities).unwrap();

        let registry = IdRegistry::new();
        let restored = Map::from_snapshot(MapSnapshot::read_from(buf.as_slice()).unwrap(), registry.clone());
        let entities: MapEntities = bincode::deserialize(&encoded_entities).unwrap();
        let mut db = KeyFrameDatabase::new();
        let cams = HashMap::from([(
            CameraId::new(0),
            CameraModel::pinhole(CameraId::new(0), 400.0, 400.0, 320.0, 240.0, 640, 480),
        )]);
        let report = restored.post_load(&mut db, &WordCountVocabulary, &entities, &cams);

        assert_eq!(restored.id(), map.id());
        assert_eq!(restored.status(), MapStatus::Stored);
        assert_eq!(restored.all_keyframes(), map.all_keyframes());
        assert_eq!(restored.all_map_lines(), map.all_map_lines());
        assert_eq!(restored.map_points_in_map(), 1);
        assert_eq!(restored.init_kf_id(), map.init_kf_id());
        assert_eq!(restored.max_kf_id(), map.max_kf_id());
        assert_eq!(restored.last_big_change_index(), 1);
        assert_eq!(restored.origin_keyframes(), vec![kfs[0]]);
        assert!(restored.is_inertial() && restored.is_imu_initialized() && restored.is_inertial_ba1());
        assert!(!restored.is_inertial_ba2());

        // The bad point's slot was scrubbed on save
        let kf1 = restored.keyframe(kfs[1]).unwrap();
        assert_eq!(kf1.get_map_point(1), None);
        assert_eq!(kf1.parent_id, Some(kfs[0]));
        assert_eq!(
            kf1.get_covisibility_weight(kfs[0]),
            map.keyframe(kfs[1]).unwrap().get_covisibility_weight(kfs[0])
        );

        assert_eq!(report.bow_recomputed, 2);
        assert_eq!(report.missing_map_points, 0);
        assert_eq!(db.len(), 2);
        assert!(restored.check_essential_graph().is_ok());

        // Fresh ids never collide with restored ones
        assert!(registry.keyframes.peek() > kfs[1].0);
        let new_kf = restored.create_keyframe(0, SE3::identity(), 0, 0).unwrap();
        assert!(new_kf > kfs[1]);
    }

    #[test]
    fn test_post_load_skips_missing_entities() {
        let (map, kfs) = populated_map(IdRegistry::new());
        let (snapshot, mut entities) = map.pre_save(&mut BTreeSet::new());
        let lost_point = snapshot.map_point_ids[0];
        entities.map_points.remove(&lost_point);

        let restored = Map::from_snapshot(snapshot, IdRegistry::new());
        let mut db = KeyFrameDatabase::new();
        let report = restored.post_load(&mut db, &WordCountVocabulary, &entities, &HashMap::new());

        assert_eq!(report.missing_map_points, 1);
        assert_eq!(report.unresolved_backbone, 0);
        assert_eq!(report.unresolved_cameras, 2);
        assert!(report.dropped_references >= 2);
        assert_eq!(restored.map_points_in_map(), 0);
        let kf0 = restored.keyframe(kfs[0]).unwrap();
        assert_eq!(kf0.get_map_point(0), None);
        assert_eq!(kf0.camera_id, None);

        // A second call has nothing left to restore
        let again = restored.post_load(&mut db, &WordCountVocabulary, &entities, &HashMap::new());
        assert_eq!(again, PostLoadReport::default());
    }

    #[test]
    fn test_post_load_drops_missing_backbone_ids() {
        let (map, kfs) = populated_map(IdRegistry::new());
        let (snapshot, mut entities) = map.pre_save(&mut BTreeSet::new());
        entities.keyframes.remove(&kfs[0]);

        let restored = Map::from_snapshot(snapshot, IdRegistry::new());
        let mut db = KeyFrameDatabase::new();
        let report = restored.post_load(&mut db, &WordCountVocabulary, &entities, &HashMap::new());

        assert_eq!(report.missing_keyframes, 1);
        // origin, initial and lowest all pointed at the lost keyframe
        assert_eq!(report.unresolved_backbone, 3);
        assert_eq!(restored.initial_keyframe_id(), None);
        assert_eq!(restored.lower_keyframe_id(), None);
        assert!(restored.origin_keyframes().is_empty());
        assert_eq!(restored.all_keyframes(), vec![kfs[1]]);
    }

    #[test]
    fn test_pre_save_is_one_consistent_view() {
        let (map, _) = populated_map(IdRegistry::new());
        let (snapshot, entities) = map.pre_save(&mut BTreeSet::new());

        let mut listed: Vec<_> = entities.map_points.keys().copied().collect();
        listed.sort();
        assert_eq!(listed, snapshot.map_point_ids);
        let mut listed: Vec<_> = entities.keyframes.keys().copied().collect();
        listed.sort();
        assert_eq!(listed, snapshot.keyframe_ids);

        // Later mutations do not leak into an already built save
        let first = snapshot.map_point_ids[0];
        map.erase_map_point(first);
        let kf = snapshot.keyframe_ids[0];
        map.create_map_point(Vector3::zeros(), [0; 32], kf).unwrap();
        assert!(entities.map_points.contains_key(&first));
        assert_eq!(entities.map_points.len(), snapshot.map_point_ids.len());
    }

    #[test]
    fn test_clear_resets_entities() {
        let (map, _) = populated_map(IdRegistry::new());
        map.semantic().add_person_track(Vector3::zeros());
        let init = map.init_kf_id();
        map.inform_new_big_change();
        let big_change = map.last_big_change_index();
        assert_eq!(big_change, 2);

        map.clear();
        assert_eq!(map.keyframes_in_map(), 0);
        assert_eq!(map.map_points_in_map(), 0);
        assert_eq!(map.init_kf_id(), init);
        assert_eq!(map.max_kf_id(), init);
        assert!(!map.is_imu_initialized());
        assert!(map.is_inertial());
        assert_eq!(map.last_big_change_index(), big_change);
        assert!(map.semantic().person_track().is_empty());

        map.inform_new_big_change();
        assert_eq!(map.last_big_change_index(), big_change + 1);
    }
}
