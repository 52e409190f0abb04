//! Deterministic scene, engine and source fixtures. A synthetic scene holds
//! ground-truth landmarks and poses; the scripted engine derives detections
//! and motion estimates from it, with injectable faults.

use std::collections::{HashMap, HashSet};

use nalgebra::{UnitQuaternion, Vector3};
use ndarray::{Array2, Array3};

use crate::{
    camera::{DepthSensorModel, Intrinsics},
    error::FrameFault,
    features::{
        FeatureEngine, FeatureSet, MatchOutcome, Measurement, NewLandmark, VisibleLandmark,
        VoEstimate,
    },
    frame::{FrameSource, SensorFrame},
    map::FeaturesMap,
    transform::Transform,
};

/// Deterministic descriptor for ground-truth point `index`. Distinct
/// indices give descriptors far apart in Hamming distance.
pub fn descriptor_for(index: usize) -> Vec<u8> {
    (0..32)
        .map(|byte| ((index * 31 + byte * 17) % 251) as u8)
        .collect()
}

#[derive(Clone)]
pub struct SyntheticScene {
    pub points: Vec<Vector3<f64>>,
    /// Ground-truth sensor poses, one per frame.
    pub poses: Vec<Transform>,
    pub timestamps: Vec<f64>,
    pub intrinsics: Intrinsics,
    pub width: usize,
    pub height: usize,
    pub depth_scale: f64,
}

/// A 4-column grid of landmarks at 2.5 m depth, 0.3 m apart: comfortably
/// inside the admissible depth window, with projections spread tens of
/// pixels apart.
fn grid_points(count: usize) -> Vec<Vector3<f64>> {
    (0..count)
        .map(|index| {
            let col = (index % 4) as f64;
            let row = (index / 4) as f64;
            Vector3::new(-0.45 + 0.3 * col, -0.3 + 0.3 * row, 2.5)
        })
        .collect()
}

fn scene_with_poses(num_points: usize, poses: Vec<Transform>) -> SyntheticScene {
    let timestamps = (0..poses.len())
        .map(|index| 1000.0 + index as f64 / 30.0)
        .collect();
    SyntheticScene {
        points: grid_points(num_points),
        poses,
        timestamps,
        intrinsics: Intrinsics::new(525.0, 525.0, 319.5, 239.5),
        width: 640,
        height: 480,
        depth_scale: 5000.0,
    }
}

/// Motionless sensor observing the grid for `num_frames` frames.
pub fn static_scene(num_points: usize, num_frames: usize) -> SyntheticScene {
    scene_with_poses(num_points, vec![Transform::eye(); num_frames])
}

/// Sensor translating `step` meters along +z each frame.
pub fn forward_scene(num_points: usize, num_frames: usize, step: f64) -> SyntheticScene {
    let poses = (0..num_frames)
        .map(|index| {
            Transform::from_parts(
                Vector3::new(0.0, 0.0, step * index as f64),
                UnitQuaternion::identity(),
            )
        })
        .collect();
    scene_with_poses(num_points, poses)
}

impl SyntheticScene {
    pub fn sensor(&self) -> DepthSensorModel {
        DepthSensorModel::new(
            self.intrinsics.clone(),
            self.width,
            self.height,
            self.depth_scale,
        )
        .expect("synthetic calibration is valid")
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    /// A frame for `index`, with tiny placeholder images: the scripted
    /// engine reads the scene, not the pixels.
    pub fn frame(&self, index: usize) -> SensorFrame {
        SensorFrame::new(
            self.timestamps[index],
            Array3::zeros((6, 8, 3)),
            Array2::zeros((6, 8)),
            self.depth_scale,
        )
    }

    /// Ground-truth increment from frame `index - 1` to `index`.
    pub fn increment(&self, index: usize) -> Transform {
        &self.poses[index - 1].inverse() * &self.poses[index]
    }

    fn frame_index(&self, frame: &SensorFrame) -> usize {
        self.timestamps
            .iter()
            .position(|&timestamp| (timestamp - frame.timestamp).abs() < 1e-9)
            .expect("frame timestamp unknown to the scene")
    }

    /// Ground-truth detections from pose `index`: every point in the
    /// frustum within a generous depth band, in point order.
    pub fn detect(&self, index: usize) -> FeatureSet {
        let sensor = self.sensor();
        let cam_from_world = self.poses[index].inverse();

        let mut features = FeatureSet::default();
        for (point_index, point) in self.points.iter().enumerate() {
            let local = cam_from_world.transform_point(point);
            if local.z < 0.3 || local.z > 9.0 || !sensor.in_frustum(&local) {
                continue;
            }
            let pixel = sensor.project(&local);
            features.distorted.push(pixel);
            features.undistorted.push(pixel);
            features.points.push(local);
            features.descriptors.push(descriptor_for(point_index));
            features.octaves.push(0);
            features.responses.push(10.0);
        }
        features
    }
}

/// Scripted [`FeatureEngine`] over a [`SyntheticScene`].
pub struct SyntheticEngine {
    scene: SyntheticScene,
    cursor: usize,
    features: FeatureSet,
    vo_overrides: HashMap<usize, Transform>,
    vo_failures: HashSet<usize>,
    drift: Vector3<f64>,
    measurement_cap: Option<usize>,
    match_success_attempt: u32,
}

impl SyntheticEngine {
    pub fn new(scene: SyntheticScene) -> Self {
        Self {
            scene,
            cursor: 0,
            features: FeatureSet::default(),
            vo_overrides: HashMap::new(),
            vo_failures: HashSet::new(),
            drift: Vector3::zeros(),
            measurement_cap: None,
            match_success_attempt: 1,
        }
    }

    /// Makes `run_vo` report this increment at `frame_index` instead of the
    /// ground-truth one.
    pub fn override_increment(&mut self, frame_index: usize, increment: Transform) {
        self.vo_overrides.insert(frame_index, increment);
    }

    /// Makes `run_vo` fail at `frame_index`.
    pub fn fail_vo_at(&mut self, frame_index: usize) {
        self.vo_failures.insert(frame_index);
    }

    /// Adds a constant translation bias to every reported VO increment.
    pub fn set_drift(&mut self, drift: Vector3<f64>) {
        self.drift = drift;
    }

    /// Truncates every match result to `cap` measurements.
    pub fn cap_measurements(&mut self, cap: usize) {
        self.measurement_cap = Some(cap);
    }

    /// Makes map matching return nothing until the given attempt number.
    pub fn succeed_matching_from_attempt(&mut self, attempt: u32) {
        self.match_success_attempt = attempt;
    }

    /// Points the engine at a frame without running VO, refreshing its
    /// detections.
    pub fn set_cursor(&mut self, index: usize) {
        self.cursor = index;
        self.features = self.scene.detect(index);
    }
}

impl FeatureEngine for SyntheticEngine {
    fn detect_init(&mut self, frame: &SensorFrame) -> usize {
        self.set_cursor(self.scene.frame_index(frame));
        self.features.len()
    }

    fn features(&self) -> &FeatureSet {
        &self.features
    }

    fn run_vo(&mut self, frame: &SensorFrame) -> Option<VoEstimate> {
        let index = self.scene.frame_index(frame);
        self.set_cursor(index);
        if index == 0 || self.vo_failures.contains(&index) {
            return None;
        }

        let increment = match self.vo_overrides.get(&index) {
            Some(increment) => increment.clone(),
            None => self.scene.increment(index),
        };
        let increment =
            Transform::from_parts(increment.translation() + self.drift, increment.rotation());

        Some(VoEstimate {
            increment,
            inlier_ratio: 0.9,
            inlier_count: self.features.len(),
        })
    }

    fn match_map(
        &mut self,
        frame: &SensorFrame,
        visible: &[VisibleLandmark],
        keyframe_id: u32,
        attempt: u32,
    ) -> MatchOutcome {
        let index = self.scene.frame_index(frame);
        if attempt < self.match_success_attempt {
            return MatchOutcome::default();
        }

        let detections = self.scene.detect(index);
        let mut measurements: Vec<Measurement> = visible
            .iter()
            .filter_map(|landmark| {
                let detection = detections
                    .descriptors
                    .iter()
                    .position(|descriptor| *descriptor == landmark.descriptor)?;
                Some(Measurement {
                    landmark_id: landmark.id,
                    keyframe_id,
                    position_local: detections.points[detection],
                    view: Some(detections.view(detection)),
                    normal: None,
                    rgb_gradient: None,
                })
            })
            .collect();

        let inlier_ratio = if visible.is_empty() {
            0.0
        } else {
            measurements.len() as f64 / visible.len() as f64
        };
        if let Some(cap) = self.measurement_cap {
            measurements.truncate(cap);
        }

        MatchOutcome {
            measurements,
            inlier_ratio,
        }
    }

    fn compute_normals(&self, _frame: &SensorFrame, measurements: &mut [Measurement]) {
        for measurement in measurements {
            measurement.normal = Some(-measurement.position_local.normalize());
        }
    }

    fn compute_rgb_gradients(&self, _frame: &SensorFrame, measurements: &mut [Measurement]) {
        for measurement in measurements {
            measurement.rgb_gradient = Some(Vector3::new(0.5, 0.25, 0.125));
        }
    }
}

/// Frame source replaying a synthetic scene, with optional injected decode
/// faults.
pub struct SyntheticSource {
    scene: SyntheticScene,
    next: usize,
    faults: HashSet<usize>,
}

impl SyntheticSource {
    pub fn new(scene: SyntheticScene) -> Self {
        Self {
            scene,
            next: 0,
            faults: HashSet::new(),
        }
    }

    /// Makes frame `index` fail to decode once; the stream continues after.
    pub fn fault_at(&mut self, index: usize) {
        self.faults.insert(index);
    }
}

impl FrameSource for SyntheticSource {
    fn grab(&mut self) -> Result<Option<SensorFrame>, FrameFault> {
        if self.next >= self.scene.len() {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;
        if self.faults.contains(&index) {
            return Err(FrameFault(format!("synthetic decode fault at {index}")));
        }
        Ok(Some(self.scene.frame(index)))
    }

    fn intrinsics(&self) -> Intrinsics {
        self.scene.intrinsics.clone()
    }

    fn depth_scale(&self) -> f64 {
        self.scene.depth_scale
    }

    fn extent(&self) -> (usize, usize) {
        (self.scene.width, self.scene.height)
    }

    fn starting_pose(&self) -> Transform {
        self.scene.poses[0].clone()
    }
}

/// Seeds the map with a keyframe at the scene's ground-truth pose and a
/// landmark per detection of that frame.
pub fn populate_map_from_frame(
    map: &FeaturesMap,
    engine: &mut SyntheticEngine,
    scene: &SyntheticScene,
    index: usize,
) -> u32 {
    engine.detect_init(&scene.frame(index));
    let keyframe_id = map.add_pose(
        scene.poses[index].clone(),
        scene.timestamps[index],
        None,
        None,
    );

    let features = engine.features();
    let candidates: Vec<NewLandmark> = (0..features.len())
        .map(|i| NewLandmark {
            position_local: features.points[i],
            undistorted: features.undistorted[i],
            view: features.view(i),
        })
        .collect();
    map.add_features(candidates, keyframe_id);
    keyframe_id
}
