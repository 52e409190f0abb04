use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::{
    config::LoopClosureConfig,
    features::descriptor_distance,
    map::FeaturesMap,
    transform::Transform,
};

use super::Worker;

/// One considered keyframe pair, kept for post-run analysis.
#[derive(Clone, Debug)]
pub struct LoopPair {
    pub first: u32,
    pub second: u32,
    /// Cheap descriptor-bag similarity.
    pub probability: f64,
    /// Inlier ratio of the rigid fit; zero when the full matcher never ran.
    pub matching_ratio: f64,
}

/// State shared between the loop-closure worker and the pipeline.
#[derive(Default)]
pub struct LoopClosureShared {
    pub pairs: Mutex<Vec<LoopPair>>,
    pub accepted: AtomicUsize,
    pub spurious: AtomicUsize,
}

impl LoopClosureShared {
    pub fn log_pair(&self, pair: LoopPair) {
        self.pairs
            .lock()
            .expect("loop pair log poisoned")
            .push(pair);
    }

    pub fn pairs_snapshot(&self) -> Vec<LoopPair> {
        self.pairs.lock().expect("loop pair log poisoned").clone()
    }
}

/// One keyframe's observations: descriptor and local position per landmark.
type Bag = Vec<(Vec<u8>, Vector3<f64>)>;

fn snapshot_bags(map: &FeaturesMap) -> Vec<Bag> {
    map.with_state(|state| {
        state
            .keyframes
            .iter()
            .map(|keyframe| {
                keyframe
                    .observed
                    .iter()
                    .filter_map(|&landmark_id| {
                        let landmark = state.landmark(landmark_id)?;
                        let view = landmark.views.get(&keyframe.id)?;
                        Some((view.descriptor.clone(), view.local_position))
                    })
                    .collect()
            })
            .collect()
    })
}

/// Fraction of the first bag's descriptors with a close enough counterpart
/// in the second.
fn bag_similarity(first: &Bag, second: &Bag, max_distance: f64) -> f64 {
    if first.is_empty() || second.is_empty() {
        return 0.0;
    }
    let matched = first
        .iter()
        .filter(|(descriptor, _)| {
            second
                .iter()
                .any(|(other, _)| descriptor_distance(descriptor, other) <= max_distance)
        })
        .count();
    matched as f64 / first.len() as f64
}

/// Descriptor correspondences between two bags, as local position pairs.
fn correspondences(first: &Bag, second: &Bag, max_distance: f64) -> Vec<(Vector3<f64>, Vector3<f64>)> {
    first
        .iter()
        .filter_map(|(descriptor, position_first)| {
            let (best_distance, position_second) = second
                .iter()
                .map(|(other, position)| (descriptor_distance(descriptor, other), *position))
                .min_by_key(|&(distance, _)| OrderedFloat(distance))?;
            if best_distance <= max_distance {
                Some((*position_first, position_second))
            } else {
                None
            }
        })
        .collect()
}

/// Least-squares rigid fit `dst ≈ T * src` over point pairs (Kabsch).
/// Returns `None` for degenerate geometry.
pub fn fit_rigid(pairs: &[(Vector3<f64>, Vector3<f64>)]) -> Option<Transform> {
    if pairs.len() < 3 {
        return None;
    }

    let n = pairs.len() as f64;
    let dst_centroid: Vector3<f64> = pairs.iter().map(|(dst, _)| dst).sum::<Vector3<f64>>() / n;
    let src_centroid: Vector3<f64> = pairs.iter().map(|(_, src)| src).sum::<Vector3<f64>>() / n;

    let mut cross_covariance = Matrix3::<f64>::zeros();
    for (dst, src) in pairs {
        cross_covariance += (src - src_centroid) * (dst - dst_centroid).transpose();
    }

    let svd = cross_covariance.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut rotation = v_t.transpose() * u.transpose();
    if rotation.determinant() < 0.0 {
        let mut flip = Matrix3::identity();
        flip[(2, 2)] = -1.0;
        rotation = v_t.transpose() * flip * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation));
    let translation = dst_centroid - rotation * src_centroid;
    Some(Transform::from_parts(translation, rotation))
}

/// Sweeps untested keyframe pairs once. Logs every considered pair and
/// emits a pose-pose edge for every accepted closure. Returns the number of
/// accepted closures this sweep.
pub fn scan_for_closures(
    map: &FeaturesMap,
    config: &LoopClosureConfig,
    shared: &LoopClosureShared,
    tested: &mut HashSet<(u32, u32)>,
) -> usize {
    let bags = snapshot_bags(map);

    let candidates: Vec<(u32, u32)> = (0..bags.len())
        .flat_map(|i| {
            ((i + config.min_gap as usize)..bags.len()).map(move |j| (i as u32, j as u32))
        })
        .filter(|pair| !tested.contains(pair))
        .filter(|&(i, j)| !bags[i as usize].is_empty() && !bags[j as usize].is_empty())
        .collect();

    let probabilities: Vec<f64> = candidates
        .par_iter()
        .map(|&(i, j)| {
            bag_similarity(
                &bags[i as usize],
                &bags[j as usize],
                config.max_descriptor_distance,
            )
        })
        .collect();

    let mut accepted = 0;
    for (&(i, j), &probability) in candidates.iter().zip(probabilities.iter()) {
        tested.insert((i, j));

        if probability < config.min_probability {
            shared.log_pair(LoopPair {
                first: i,
                second: j,
                probability,
                matching_ratio: 0.0,
            });
            continue;
        }

        let pairs = correspondences(
            &bags[i as usize],
            &bags[j as usize],
            config.max_descriptor_distance,
        );
        let fit = if pairs.len() >= config.min_shared_landmarks {
            fit_rigid(&pairs)
        } else {
            None
        };

        let (matching_ratio, increment) = match fit {
            Some(increment) => {
                let inliers = pairs
                    .iter()
                    .filter(|(dst, src)| {
                        (dst - increment.transform_point(src)).norm() <= config.inlier_radius
                    })
                    .count();
                (inliers as f64 / pairs.len() as f64, Some(increment))
            }
            None => (0.0, None),
        };

        shared.log_pair(LoopPair {
            first: i,
            second: j,
            probability,
            matching_ratio,
        });

        match increment {
            Some(increment) if matching_ratio >= config.min_matching_ratio => {
                log::info!(
                    "loop closure ({i}, {j}): probability {probability:.2}, \
                     matching ratio {matching_ratio:.2}"
                );
                if map.add_measurement(i, j, increment) {
                    shared.accepted.fetch_add(1, Ordering::Relaxed);
                    accepted += 1;
                }
            }
            _ => {
                // Geometric check failed: dropped without a trace beyond the
                // pair log.
                shared.spurious.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    accepted
}

/// Background loop-closure detector.
pub fn spawn_loop_closure(
    map: Arc<FeaturesMap>,
    config: LoopClosureConfig,
    shared: Arc<LoopClosureShared>,
) -> Worker {
    Worker::spawn("loop-closure", move |stop| {
        let mut tested = HashSet::new();
        let mut seen_epoch = 0;
        while !stop.load(Ordering::Acquire) {
            let epoch = map.wait_structural_change(seen_epoch, Duration::from_millis(50));
            if epoch <= seen_epoch {
                continue;
            }
            seen_epoch = epoch;
            scan_for_closures(&map, &config, &shared, &mut tested);
        }
        // Drain pairs that arrived since the last sweep so late closures
        // still reach the deferred optimizer.
        scan_for_closures(&map, &config, &shared, &mut tested);
    })
}
