mod state;

pub use state::{FeatureEdge, Keyframe, Landmark, MapState, PoseEdge, NO_FRAME};

use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use nalgebra::Vector3;
use ndarray::{Array2, Array3};

use crate::{
    camera::DepthSensorModel,
    features::{Measurement, NewLandmark},
    trajectory::Trajectory,
    transform::Transform,
};

/// Thread-safe feature map. The single shared mutable structure of the
/// pipeline: the foreground tracking thread performs structural edits, the
/// optimizer publishes value batches, and the loop-closure and map-manager
/// workers read and mutate it concurrently.
///
/// Structural edits take the write lock; queries take the read lock and
/// return snapshots, never internal references. A structural epoch counter
/// behind its own mutex wakes background workers after every edit.
pub struct FeaturesMap {
    state: RwLock<MapState>,
    epoch: Mutex<u64>,
    structural_change: Condvar,
}

impl FeaturesMap {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MapState::new()),
            epoch: Mutex::new(0),
            structural_change: Condvar::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MapState> {
        self.state.read().expect("map lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, MapState> {
        self.state.write().expect("map lock poisoned")
    }

    fn bump_epoch(&self) {
        let mut epoch = self.epoch.lock().expect("map epoch lock poisoned");
        *epoch += 1;
        self.structural_change.notify_all();
    }

    /// Current structural epoch. Workers remember it between ticks.
    pub fn structural_epoch(&self) -> u64 {
        *self.epoch.lock().expect("map epoch lock poisoned")
    }

    /// Blocks until the structural epoch moves past `seen` or `timeout`
    /// elapses. Returns the epoch observed on wake-up.
    pub fn wait_structural_change(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = self.epoch.lock().expect("map epoch lock poisoned");
        let (guard, _) = self
            .structural_change
            .wait_timeout_while(guard, timeout, |epoch| *epoch <= seen)
            .expect("map epoch lock poisoned");
        *guard
    }

    /// Appends a keyframe whose world pose is the previous pose composed
    /// with `pose` (the first keyframe takes `pose` as absolute). Returns
    /// the keyframe id.
    pub fn add_pose(
        &self,
        pose: Transform,
        timestamp: f64,
        color: Option<Array3<u8>>,
        depth: Option<Array2<u16>>,
    ) -> u32 {
        let id = self.write().add_pose(pose, timestamp, color, depth);
        self.bump_epoch();
        id
    }

    /// Pose of the newest keyframe.
    pub fn sensor_pose(&self) -> Transform {
        self.read().sensor_pose()
    }

    pub fn sensor_pose_of(&self, id: u32) -> Option<Transform> {
        self.read().sensor_pose_of(id)
    }

    pub fn images_of(&self, id: u32) -> Option<(Array3<u8>, Array2<u16>)> {
        self.read().images_of(id)
    }

    pub fn keyframe_count(&self) -> usize {
        self.read().keyframe_count()
    }

    pub fn landmark_count(&self) -> usize {
        self.read().landmark_count()
    }

    pub fn landmark(&self, id: u32) -> Option<Landmark> {
        self.read().landmark(id).cloned()
    }

    pub fn visible_features(&self, sensor: &DepthSensorModel, max_depth: f64) -> Vec<Landmark> {
        self.read().visible_features(sensor, max_depth)
    }

    pub fn covisible_features(&self, min_shared: usize) -> Vec<Landmark> {
        self.read().covisible_features(min_shared)
    }

    pub fn covisible_of(&self, id: u32, min_shared: usize) -> Vec<u32> {
        self.read().covisible_of(id, min_shared)
    }

    pub fn find_nearest_frame(
        &self,
        landmarks: &[Landmark],
        max_angle: f64,
    ) -> (Vec<i32>, Vec<f64>) {
        self.read().find_nearest_frame(landmarks, max_angle)
    }

    /// Pose-pose edge `from → to`.
    pub fn add_measurement(&self, from: u32, to: u32, increment: Transform) -> bool {
        let added = self.write().add_measurement(from, to, increment);
        if added {
            self.bump_epoch();
        }
        added
    }

    /// Pose-landmark edges. Returns how many were admitted.
    pub fn add_measurements(&self, measurements: Vec<Measurement>) -> usize {
        let added = self.write().add_measurements(measurements);
        if added > 0 {
            self.bump_epoch();
        }
        added
    }

    /// Creates landmarks observed by `keyframe_id` and their initial view
    /// descriptors. Returns the new landmark ids.
    pub fn add_features(&self, candidates: Vec<NewLandmark>, keyframe_id: u32) -> Vec<u32> {
        let ids = self.write().add_features(candidates, keyframe_id);
        if !ids.is_empty() {
            self.bump_epoch();
        }
        ids
    }

    /// Batched publication of refined poses and landmark positions. Readers
    /// see the old or the new value per entity, never a torn mix.
    pub fn publish_estimates(&self, poses: &[(u32, Transform)], landmarks: &[(u32, Vector3<f64>)]) {
        self.write().publish_estimates(poses, landmarks);
    }

    /// Single-entity form of [`FeaturesMap::publish_estimates`].
    pub fn update_pose(&self, id: u32, pose: Transform) {
        self.write().publish_estimates(&[(id, pose)], &[]);
    }

    /// Single-entity form of [`FeaturesMap::publish_estimates`].
    pub fn update_landmark(&self, id: u32, position: Vector3<f64>) {
        self.write().publish_estimates(&[], &[(id, position)]);
    }

    pub fn prune_stale(&self, min_views: usize, stale_age: u32) -> Vec<u32> {
        let removed = self.write().prune_stale(min_views, stale_age);
        if !removed.is_empty() {
            self.bump_epoch();
        }
        removed
    }

    pub fn merge_close(&self, distance: f64) -> usize {
        let merged = self.write().merge_close(distance);
        if merged > 0 {
            self.bump_epoch();
        }
        merged
    }

    pub fn trajectory(&self) -> Trajectory {
        self.read().trajectory()
    }

    /// Runs `f` on the state under the read lock. Used by the optimizer to
    /// snapshot poses, landmarks and edges in one consistent view.
    pub fn with_state<R>(&self, f: impl FnOnce(&MapState) -> R) -> R {
        f(&self.read())
    }
}

impl Default for FeaturesMap {
    fn default() -> Self {
        Self::new()
    }
}
