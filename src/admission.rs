use nalgebra::Vector3;

use crate::{
    config::SlamConfig,
    features::{FeatureSet, NewLandmark, VisibleLandmark},
};

/// Whether the current frame should spawn new landmarks: the map got too
/// sparse, or matching got too weak while the map is not already saturated.
pub fn should_add_features(
    visible_count: usize,
    measurement_count: usize,
    config: &SlamConfig,
) -> bool {
    visible_count < config.min_visible
        || (measurement_count < config.min_measurements && visible_count < config.no_add_ceiling)
}

fn separated(
    position: &Vector3<f64>,
    pixel: (f64, f64),
    other_position: &Vector3<f64>,
    other_pixel: (f64, f64),
    config: &SlamConfig,
) -> bool {
    if (position - other_position).norm() < config.d_euc {
        return false;
    }
    let du = pixel.0 - other_pixel.0;
    let dv = pixel.1 - other_pixel.1;
    if (du * du + dv * dv).sqrt() < config.d_img {
        return false;
    }
    true
}

/// Selects landmark candidates from the current frame's detections, in
/// detector order, bounded by `max_once_add`.
///
/// A candidate survives the depth gate and must keep both the euclidean and
/// the image separation from every visible landmark and every candidate
/// accepted before it. Rejections are silent.
pub fn select_new_landmarks(
    features: &FeatureSet,
    visible: &[VisibleLandmark],
    config: &SlamConfig,
) -> Vec<NewLandmark> {
    let mut accepted: Vec<NewLandmark> = Vec::new();

    for index in 0..features.len() {
        if accepted.len() >= config.max_once_add {
            break;
        }

        let position = features.points[index];
        if position.z < config.min_depth || position.z > config.max_depth_admit {
            continue;
        }

        let pixel = features.undistorted[index];
        let clear_of_map = visible.iter().all(|landmark| {
            separated(
                &position,
                pixel,
                &landmark.position,
                landmark.projection,
                config,
            )
        });
        if !clear_of_map {
            continue;
        }

        let clear_of_accepted = accepted.iter().all(|candidate| {
            separated(
                &position,
                pixel,
                &candidate.position_local,
                candidate.undistorted,
                config,
            )
        });
        if !clear_of_accepted {
            continue;
        }

        accepted.push(NewLandmark {
            position_local: position,
            undistorted: pixel,
            view: features.view(index),
        });
    }

    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_test::{static_scene, SyntheticEngine};
    use crate::features::FeatureEngine;
    use itertools::Itertools;

    #[test]
    fn test_spawn_trigger() {
        let config = SlamConfig::default();
        // Sparse map.
        assert!(should_add_features(10, 100, &config));
        // Weak matching below the ceiling.
        assert!(should_add_features(30, 3, &config));
        // Weak matching but the map is saturated.
        assert!(!should_add_features(60, 3, &config));
        // Healthy.
        assert!(!should_add_features(30, 20, &config));
    }

    #[test]
    fn test_depth_gate() {
        let scene = static_scene(12, 1);
        let mut engine = SyntheticEngine::new(scene.clone());
        engine.detect_init(&scene.frame(0));

        let mut features = engine.features().clone();
        features.points[0].z = 0.5; // below the window
        features.points[1].z = 7.0; // beyond it

        let config = SlamConfig::default();
        let accepted = select_new_landmarks(&features, &[], &config);
        assert_eq!(accepted.len(), 10);
        let ids: Vec<(f64, f64)> = accepted.iter().map(|c| c.undistorted).collect();
        assert!(!ids.contains(&features.undistorted[0]));
        assert!(!ids.contains(&features.undistorted[1]));
    }

    #[test]
    fn test_candidates_keep_separation_from_each_other() {
        let scene = static_scene(12, 1);
        let mut engine = SyntheticEngine::new(scene.clone());
        engine.detect_init(&scene.frame(0));

        // Duplicate the first detection; the copy must be rejected.
        let mut features = engine.features().clone();
        features.distorted.push(features.distorted[0]);
        features.undistorted.push(features.undistorted[0]);
        features.points.push(features.points[0]);
        features.descriptors.push(features.descriptors[0].clone());
        features.octaves.push(features.octaves[0]);
        features.responses.push(features.responses[0]);

        let config = SlamConfig::default();
        let accepted = select_new_landmarks(&features, &[], &config);
        assert_eq!(accepted.len(), 12);

        for pair in accepted.iter().combinations(2) {
            let euc = (pair[0].position_local - pair[1].position_local).norm();
            let du = pair[0].undistorted.0 - pair[1].undistorted.0;
            let dv = pair[0].undistorted.1 - pair[1].undistorted.1;
            assert!(euc >= config.d_euc && (du * du + dv * dv).sqrt() >= config.d_img);
        }
    }

    #[test]
    fn test_existing_landmarks_suppress_candidates() {
        let scene = static_scene(12, 1);
        let mut engine = SyntheticEngine::new(scene.clone());
        engine.detect_init(&scene.frame(0));
        let features = engine.features().clone();

        // Visible landmarks exactly at the detection positions.
        let visible: Vec<VisibleLandmark> = (0..features.len())
            .map(|i| VisibleLandmark {
                id: i as u32,
                position: features.points[i],
                projection: features.undistorted[i],
                descriptor: features.descriptors[i].clone(),
                octave: 0,
            })
            .collect();

        let config = SlamConfig::default();
        let accepted = select_new_landmarks(&features, &visible, &config);
        assert!(accepted.is_empty());
    }

    #[test]
    fn test_max_once_add_bound() {
        let scene = static_scene(12, 1);
        let mut engine = SyntheticEngine::new(scene.clone());
        engine.detect_init(&scene.frame(0));

        let mut config = SlamConfig::default();
        config.max_once_add = 5;
        let accepted = select_new_landmarks(engine.features(), &[], &config);
        assert_eq!(accepted.len(), 5);
    }
}
