use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;
use ndarray::{Array2, Array3};
use ordered_float::OrderedFloat;

use crate::{
    camera::DepthSensorModel,
    features::{Measurement, NewLandmark, ViewDescriptor},
    trajectory::Trajectory,
    transform::Transform,
    trig,
};

/// Sentinel emitted by nearest-frame selection when no observing keyframe
/// falls within the angle budget.
pub const NO_FRAME: i32 = -1;

/// One admitted frame. Keyframes are never deleted; they are kept for loop
/// closure.
pub struct Keyframe {
    pub id: u32,
    /// Sensor-to-world pose. Rewritten by the optimizer.
    pub world_from_cam: Transform,
    pub timestamp: f64,
    pub color: Option<Array3<u8>>,
    pub depth: Option<Array2<u16>>,
    /// Landmarks measured in this frame.
    pub observed: BTreeSet<u32>,
}

/// A persistent 3D landmark with one view descriptor per observing keyframe.
#[derive(Clone, Debug)]
pub struct Landmark {
    pub id: u32,
    /// World position. Rewritten by the optimizer.
    pub position: Vector3<f64>,
    /// Keyed by observing keyframe id. Never empty: a landmark losing its
    /// last view is deleted.
    pub views: BTreeMap<u32, ViewDescriptor>,
    pub normal: Option<Vector3<f64>>,
    pub rgb_gradient: Option<Vector3<f64>>,
    /// Keyframe id of the most recent observation.
    pub last_observed: u32,
}

/// Odometry constraint between two keyframes: `to ≈ from * increment`.
#[derive(Clone, Debug)]
pub struct PoseEdge {
    pub from: u32,
    pub to: u32,
    pub increment: Transform,
}

/// Observation constraint: the landmark seen from a keyframe at a local
/// position.
#[derive(Clone, Debug)]
pub struct FeatureEdge {
    pub keyframe: u32,
    pub landmark: u32,
    pub local_position: Vector3<f64>,
}

/// The arena behind [`crate::map::FeaturesMap`]. Keyframes and landmarks are
/// cross-referenced by dense ids, never by pointers; landmark removal leaves
/// a tombstone so ids are never reused.
pub struct MapState {
    pub keyframes: Vec<Keyframe>,
    pub landmarks: Vec<Option<Landmark>>,
    pub pose_edges: Vec<PoseEdge>,
    pub feature_edges: Vec<FeatureEdge>,
    /// Shared-landmark counts per unordered keyframe pair.
    shared_views: BTreeMap<(u32, u32), usize>,
}

fn pair_key(a: u32, b: u32) -> (u32, u32) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

impl MapState {
    pub fn new() -> Self {
        Self {
            keyframes: Vec::new(),
            landmarks: Vec::new(),
            pose_edges: Vec::new(),
            feature_edges: Vec::new(),
            shared_views: BTreeMap::new(),
        }
    }

    /// Appends a keyframe. The first call interprets `pose` as the absolute
    /// starting pose; later calls interpret it as the increment on the
    /// previous keyframe's pose.
    pub fn add_pose(
        &mut self,
        pose: Transform,
        timestamp: f64,
        color: Option<Array3<u8>>,
        depth: Option<Array2<u16>>,
    ) -> u32 {
        let id = self.keyframes.len() as u32;
        let world_from_cam = match self.keyframes.last() {
            Some(prev) => &prev.world_from_cam * &pose,
            None => pose,
        };
        self.keyframes.push(Keyframe {
            id,
            world_from_cam,
            timestamp,
            color,
            depth,
            observed: BTreeSet::new(),
        });
        id
    }

    pub fn sensor_pose(&self) -> Transform {
        self.keyframes
            .last()
            .map(|keyframe| keyframe.world_from_cam.clone())
            .unwrap_or_default()
    }

    pub fn sensor_pose_of(&self, id: u32) -> Option<Transform> {
        self.keyframes
            .get(id as usize)
            .map(|keyframe| keyframe.world_from_cam.clone())
    }

    pub fn images_of(&self, id: u32) -> Option<(Array3<u8>, Array2<u16>)> {
        let keyframe = self.keyframes.get(id as usize)?;
        match (&keyframe.color, &keyframe.depth) {
            (Some(color), Some(depth)) => Some((color.clone(), depth.clone())),
            _ => None,
        }
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    pub fn landmark_count(&self) -> usize {
        self.landmarks.iter().flatten().count()
    }

    pub fn landmark(&self, id: u32) -> Option<&Landmark> {
        self.landmarks.get(id as usize)?.as_ref()
    }

    /// Registers keyframe `keyframe_id` as an observer of landmark
    /// `landmark_id`, keeping the covisibility counts in step. The view is
    /// only inserted if the keyframe did not observe the landmark yet.
    fn record_observation(&mut self, keyframe_id: u32, landmark_id: u32, view: ViewDescriptor) {
        let observers: Vec<u32> = match self.landmark(landmark_id) {
            Some(landmark) if !landmark.views.contains_key(&keyframe_id) => {
                landmark.views.keys().copied().collect()
            }
            _ => return,
        };

        for other in observers {
            *self
                .shared_views
                .entry(pair_key(keyframe_id, other))
                .or_insert(0) += 1;
        }
        if let Some(Some(landmark)) = self.landmarks.get_mut(landmark_id as usize) {
            landmark.views.insert(keyframe_id, view);
            landmark.last_observed = landmark.last_observed.max(keyframe_id);
        }
        if let Some(keyframe) = self.keyframes.get_mut(keyframe_id as usize) {
            keyframe.observed.insert(landmark_id);
        }
    }

    /// Creates landmarks from admission candidates observed by `keyframe_id`.
    /// Candidate positions are local to that keyframe. Returns the new ids.
    pub fn add_features(&mut self, candidates: Vec<NewLandmark>, keyframe_id: u32) -> Vec<u32> {
        let world_from_cam = match self.sensor_pose_of(keyframe_id) {
            Some(pose) => pose,
            None => return Vec::new(),
        };

        let mut ids = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let id = self.landmarks.len() as u32;
            let position = world_from_cam.transform_point(&candidate.position_local);
            self.landmarks.push(Some(Landmark {
                id,
                position,
                views: BTreeMap::new(),
                normal: None,
                rgb_gradient: None,
                last_observed: keyframe_id,
            }));
            self.feature_edges.push(FeatureEdge {
                keyframe: keyframe_id,
                landmark: id,
                local_position: candidate.position_local,
            });
            self.record_observation(keyframe_id, id, candidate.view);
            ids.push(id);
        }
        ids
    }

    /// Adds a pose-pose edge. Edges with missing endpoints or identical
    /// endpoints are refused.
    pub fn add_measurement(&mut self, from: u32, to: u32, increment: Transform) -> bool {
        let count = self.keyframes.len() as u32;
        if from == to || from >= count || to >= count {
            log::warn!("refusing pose edge ({from}, {to}) with {count} keyframes");
            return false;
        }
        self.pose_edges.push(PoseEdge {
            from,
            to,
            increment,
        });
        true
    }

    /// Adds pose-landmark edges for matched observations. Measurements
    /// against pruned landmarks are dropped.
    pub fn add_measurements(&mut self, measurements: Vec<Measurement>) -> usize {
        let mut added = 0;
        for measurement in measurements {
            let live = self
                .landmarks
                .get(measurement.landmark_id as usize)
                .map_or(false, Option::is_some);
            if !live || measurement.keyframe_id as usize >= self.keyframes.len() {
                continue;
            }

            self.feature_edges.push(FeatureEdge {
                keyframe: measurement.keyframe_id,
                landmark: measurement.landmark_id,
                local_position: measurement.position_local,
            });
            if let Some(view) = measurement.view {
                self.record_observation(measurement.keyframe_id, measurement.landmark_id, view);
            }
            if let Some(Some(landmark)) = self.landmarks.get_mut(measurement.landmark_id as usize)
            {
                if measurement.normal.is_some() {
                    landmark.normal = measurement.normal;
                }
                if measurement.rgb_gradient.is_some() {
                    landmark.rgb_gradient = measurement.rgb_gradient;
                }
                landmark.last_observed = landmark.last_observed.max(measurement.keyframe_id);
            }
            added += 1;
        }
        added
    }

    /// Landmarks inside the current camera frustum, up to `max_depth` meters
    /// ahead. Returns snapshots.
    pub fn visible_features(&self, sensor: &DepthSensorModel, max_depth: f64) -> Vec<Landmark> {
        let cam_from_world = self.sensor_pose().inverse();
        self.landmarks
            .iter()
            .flatten()
            .filter(|landmark| {
                let local = cam_from_world.transform_point(&landmark.position);
                local.z <= max_depth && sensor.in_frustum(&local)
            })
            .cloned()
            .collect()
    }

    /// Keyframes covisible with `id`: those sharing at least `min_shared`
    /// landmarks.
    pub fn covisible_of(&self, id: u32, min_shared: usize) -> Vec<u32> {
        self.keyframes
            .iter()
            .filter(|other| {
                other.id != id
                    && self
                        .shared_views
                        .get(&pair_key(id, other.id))
                        .map_or(false, |&count| count >= min_shared)
            })
            .map(|other| other.id)
            .collect()
    }

    /// Landmarks observed by the newest keyframe's covisibility
    /// neighborhood. The newest keyframe has no observations at query time,
    /// so the neighborhood is anchored at the most recent keyframe that has
    /// some: that keyframe plus everything covisible with it.
    pub fn covisible_features(&self, min_shared: usize) -> Vec<Landmark> {
        let anchor = match self
            .keyframes
            .iter()
            .rev()
            .find(|keyframe| !keyframe.observed.is_empty())
        {
            Some(keyframe) => keyframe.id,
            None => return Vec::new(),
        };

        let mut neighborhood = self.covisible_of(anchor, min_shared);
        neighborhood.push(anchor);

        let mut ids = BTreeSet::new();
        for keyframe_id in neighborhood {
            if let Some(keyframe) = self.keyframes.get(keyframe_id as usize) {
                ids.extend(keyframe.observed.iter().copied());
            }
        }
        ids.iter()
            .filter_map(|&id| self.landmark(id).cloned())
            .collect()
    }

    /// For each landmark, the observing keyframe whose viewing ray deviates
    /// least from the current one, provided the deviation stays within
    /// `max_angle`; otherwise the sentinel [`NO_FRAME`]. Ties break toward
    /// the smaller keyframe id.
    pub fn find_nearest_frame(
        &self,
        landmarks: &[Landmark],
        max_angle: f64,
    ) -> (Vec<i32>, Vec<f64>) {
        let current = self.sensor_pose().translation();

        let mut frame_ids = Vec::with_capacity(landmarks.len());
        let mut angles = Vec::with_capacity(landmarks.len());
        for landmark in landmarks {
            let current_ray = landmark.position - current;
            let best = landmark
                .views
                .keys()
                .filter_map(|&keyframe_id| {
                    let keyframe = self.keyframes.get(keyframe_id as usize)?;
                    let observed_ray =
                        landmark.position - keyframe.world_from_cam.translation();
                    Some((
                        keyframe_id,
                        trig::angle_between_rays(&current_ray, &observed_ray),
                    ))
                })
                .min_by_key(|&(keyframe_id, angle)| (OrderedFloat(angle), keyframe_id));

            match best {
                Some((keyframe_id, angle)) if angle <= max_angle => {
                    frame_ids.push(keyframe_id as i32);
                    angles.push(angle);
                }
                Some((_, angle)) => {
                    frame_ids.push(NO_FRAME);
                    angles.push(angle);
                }
                None => {
                    frame_ids.push(NO_FRAME);
                    angles.push(f64::MAX);
                }
            }
        }
        (frame_ids, angles)
    }

    /// Batched value update from the optimizer. Only `world_from_cam` and
    /// `position` change; unknown or tombstoned ids are skipped.
    pub fn publish_estimates(
        &mut self,
        poses: &[(u32, Transform)],
        landmarks: &[(u32, Vector3<f64>)],
    ) {
        for (id, pose) in poses {
            if let Some(keyframe) = self.keyframes.get_mut(*id as usize) {
                keyframe.world_from_cam = pose.clone();
            }
        }
        for (id, position) in landmarks {
            if let Some(Some(landmark)) = self.landmarks.get_mut(*id as usize) {
                landmark.position = *position;
            }
        }
    }

    /// Tombstones a landmark: its views, edges and covisibility
    /// contributions all go with it.
    pub fn remove_landmark(&mut self, id: u32) -> bool {
        let landmark = match self.landmarks.get_mut(id as usize).and_then(Option::take) {
            Some(landmark) => landmark,
            None => return false,
        };

        let observers: Vec<u32> = landmark.views.keys().copied().collect();
        for (i, &a) in observers.iter().enumerate() {
            for &b in &observers[i + 1..] {
                if let Some(count) = self.shared_views.get_mut(&pair_key(a, b)) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        for &observer in &observers {
            if let Some(keyframe) = self.keyframes.get_mut(observer as usize) {
                keyframe.observed.remove(&id);
            }
        }
        self.feature_edges.retain(|edge| edge.landmark != id);
        true
    }

    /// Prunes landmarks whose view count stayed below `min_views` for more
    /// than `stale_age` keyframes. Returns the removed ids.
    pub fn prune_stale(&mut self, min_views: usize, stale_age: u32) -> Vec<u32> {
        let newest = match self.keyframes.last() {
            Some(keyframe) => keyframe.id,
            None => return Vec::new(),
        };
        let doomed: Vec<u32> = self
            .landmarks
            .iter()
            .flatten()
            .filter(|landmark| {
                landmark.views.len() < min_views
                    && newest.saturating_sub(landmark.last_observed) > stale_age
            })
            .map(|landmark| landmark.id)
            .collect();
        for &id in &doomed {
            self.remove_landmark(id);
        }
        doomed
    }

    /// Merges landmark pairs closer than `distance`, keeping the smaller id.
    /// Views of the removed landmark are unioned in and its edges
    /// redirected. Returns the number of merges.
    pub fn merge_close(&mut self, distance: f64) -> usize {
        let live: Vec<(u32, Vector3<f64>)> = self
            .landmarks
            .iter()
            .flatten()
            .map(|landmark| (landmark.id, landmark.position))
            .collect();

        let mut merged = 0;
        for (i, &(keep, position_keep)) in live.iter().enumerate() {
            if self.landmark(keep).is_none() {
                continue;
            }
            for &(gone, position_gone) in &live[i + 1..] {
                if self.landmark(gone).is_none()
                    || (position_keep - position_gone).norm() >= distance
                {
                    continue;
                }

                let views: Vec<(u32, ViewDescriptor)> = self
                    .landmark(gone)
                    .map(|landmark| {
                        landmark
                            .views
                            .iter()
                            .map(|(&keyframe, view)| (keyframe, view.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                let redirected: Vec<FeatureEdge> = self
                    .feature_edges
                    .iter()
                    .filter(|edge| edge.landmark == gone)
                    .map(|edge| FeatureEdge {
                        keyframe: edge.keyframe,
                        landmark: keep,
                        local_position: edge.local_position,
                    })
                    .collect();

                self.remove_landmark(gone);
                for (keyframe, view) in views {
                    self.record_observation(keyframe, keep, view);
                }
                for edge in redirected {
                    let duplicate = self.feature_edges.iter().any(|existing| {
                        existing.keyframe == edge.keyframe && existing.landmark == keep
                    });
                    if !duplicate {
                        self.feature_edges.push(edge);
                    }
                }
                merged += 1;
            }
        }
        merged
    }

    pub fn trajectory(&self) -> Trajectory {
        let mut trajectory = Trajectory::new();
        for keyframe in &self.keyframes {
            trajectory.push(keyframe.world_from_cam.clone(), keyframe.timestamp);
        }
        trajectory
    }
}

impl Default for MapState {
    fn default() -> Self {
        Self::new()
    }
}
