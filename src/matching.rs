use itertools::izip;

use crate::{
    camera::DepthSensorModel,
    config::SlamConfig,
    features::{FeatureEngine, Measurement, VisibleLandmark},
    frame::SensorFrame,
    map::{FeaturesMap, NO_FRAME},
};

/// Below this inlier ratio the map matcher is re-run with a wider search
/// sphere.
pub const MIN_MAP_MATCH_RATIO: f64 = 0.1;
/// Retry bound for the map matcher.
pub const MAX_MATCH_ATTEMPTS: u32 = 10;

/// Visible landmarks after ingestion: positions in the current camera frame,
/// projections filled, one nearest observing keyframe each.
#[derive(Clone, Debug, Default)]
pub struct IngestedLandmarks {
    pub visible: Vec<VisibleLandmark>,
    /// Nearest observing keyframe per entry of `visible`.
    pub nearest_frames: Vec<u32>,
}

impl IngestedLandmarks {
    pub fn len(&self) -> usize {
        self.visible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visible.is_empty()
    }
}

/// Collects landmarks worth matching against the current frame.
///
/// Covisibility drives the query; the frustum query is the fallback while
/// the covisibility graph is still empty. Landmarks without an observation
/// angle within budget and landmarks beyond the matching depth ceiling are
/// dropped.
pub fn ingest_visible(
    map: &FeaturesMap,
    sensor: &DepthSensorModel,
    config: &SlamConfig,
) -> IngestedLandmarks {
    let mut landmarks = map.covisible_features(config.covisibility_min_shared);
    if landmarks.is_empty() {
        landmarks = map.visible_features(sensor, config.max_depth_match);
    }

    let (frame_ids, _angles) = map.find_nearest_frame(&landmarks, config.max_angle_between_frames);
    let cam_from_world = map.sensor_pose().inverse();

    let mut ingested = IngestedLandmarks::default();
    for (landmark, frame_id) in izip!(landmarks, frame_ids) {
        if frame_id == NO_FRAME {
            continue;
        }
        let local = cam_from_world.transform_point(&landmark.position);
        if local.z <= 0.0 || local.z > config.max_depth_match {
            continue;
        }
        // The nearest frame observes the landmark (I1), so the view exists.
        let view = match landmark.views.get(&(frame_id as u32)) {
            Some(view) => view,
            None => continue,
        };
        ingested.visible.push(VisibleLandmark {
            id: landmark.id,
            position: local,
            projection: sensor.project(&local),
            descriptor: view.descriptor.clone(),
            octave: view.octave,
        });
        ingested.nearest_frames.push(frame_id as u32);
    }
    ingested
}

/// Result of the retried map-matching loop.
#[derive(Clone, Debug)]
pub struct MapMatch {
    pub measurements: Vec<Measurement>,
    pub inlier_ratio: f64,
    pub attempts: u32,
}

/// Matches ingested landmarks against the current frame, re-running with a
/// larger search sphere while the inlier ratio stays under
/// [`MIN_MAP_MATCH_RATIO`].
pub fn match_against_map(
    engine: &mut dyn FeatureEngine,
    frame: &SensorFrame,
    ingested: &IngestedLandmarks,
    keyframe_id: u32,
) -> MapMatch {
    let mut attempt = 1;
    let mut outcome = engine.match_map(frame, &ingested.visible, keyframe_id, attempt);
    while outcome.inlier_ratio < MIN_MAP_MATCH_RATIO && attempt < MAX_MATCH_ATTEMPTS {
        attempt += 1;
        outcome = engine.match_map(frame, &ingested.visible, keyframe_id, attempt);
        log::debug!(
            "repeated map matching, attempt {attempt}: inlier ratio {:.3}",
            outcome.inlier_ratio
        );
    }
    MapMatch {
        measurements: outcome.measurements,
        inlier_ratio: outcome.inlier_ratio,
        attempts: attempt,
    }
}

/// Which constraints a frame contributed to the graph.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeSummary {
    pub pose_pose: bool,
    pub pose_feature: usize,
}

/// Admits graph edges for the current frame. Few measurements fall back to
/// an odometry pose-pose edge; enough measurements become pose-landmark
/// edges, with normals and gradients attached when the uncertainty model is
/// on.
pub fn admit_edges(
    map: &FeaturesMap,
    engine: &mut dyn FeatureEngine,
    frame: &SensorFrame,
    vo_increment: &crate::transform::Transform,
    keyframe_id: u32,
    matched: &mut MapMatch,
    config: &SlamConfig,
) -> EdgeSummary {
    let mut summary = EdgeSummary::default();

    if matched.measurements.len() < config.max_pose_pose_measurements && keyframe_id > 0 {
        summary.pose_pose =
            map.add_measurement(keyframe_id - 1, keyframe_id, vo_increment.clone());
    }

    if matched.measurements.len() > config.min_pose_feature_measurements {
        if config.use_uncertainty {
            engine.compute_normals(frame, &mut matched.measurements);
            engine.compute_rgb_gradients(frame, &mut matched.measurements);
        }
        summary.pose_feature = map.add_measurements(matched.measurements.clone());
    }

    summary
}
