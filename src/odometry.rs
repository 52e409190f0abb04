use crate::{features::FeatureEngine, frame::SensorFrame, transform::Transform};

/// Result of one visual-odometry step after gating.
#[derive(Clone, Debug)]
pub struct VoStep {
    /// The increment actually applied. Identity when the engine failed or
    /// the estimate was rejected as erratic.
    pub increment: Transform,
    /// RANSAC inlier ratio, `-1.0` when the engine produced no estimate.
    pub inlier_ratio: f64,
    pub feature_count: usize,
    pub gated: bool,
    pub failed: bool,
}

/// Drives the feature engine frame to frame and integrates the raw VO pose.
///
/// Never stalls the foreground loop: engine failures and erratic estimates
/// degrade to an identity increment and a counter.
pub struct VoDriver {
    max_translation: f64,
    pose: Transform,
    pub failure_count: usize,
    pub gated_count: usize,
}

impl VoDriver {
    pub fn new(starting_pose: Transform, max_translation: f64) -> Self {
        Self {
            max_translation,
            pose: starting_pose,
            failure_count: 0,
            gated_count: 0,
        }
    }

    /// First frame: detection only, no motion. Returns the detection count.
    pub fn first_frame(&mut self, engine: &mut dyn FeatureEngine, frame: &SensorFrame) -> usize {
        engine.detect_init(frame)
    }

    /// Runs VO for a subsequent frame and integrates the gated increment.
    pub fn step(&mut self, engine: &mut dyn FeatureEngine, frame: &SensorFrame) -> VoStep {
        let step = match engine.run_vo(frame) {
            Some(estimate) => {
                let translation = estimate.increment.translation().norm();
                if translation > self.max_translation {
                    log::debug!(
                        "erratic VO increment gated: {translation:.3} m > {:.3} m",
                        self.max_translation
                    );
                    self.gated_count += 1;
                    VoStep {
                        increment: Transform::eye(),
                        inlier_ratio: estimate.inlier_ratio,
                        feature_count: engine.features().len(),
                        gated: true,
                        failed: false,
                    }
                } else {
                    VoStep {
                        increment: estimate.increment,
                        inlier_ratio: estimate.inlier_ratio,
                        feature_count: engine.features().len(),
                        gated: false,
                        failed: false,
                    }
                }
            }
            None => {
                self.failure_count += 1;
                VoStep {
                    increment: Transform::eye(),
                    inlier_ratio: -1.0,
                    feature_count: engine.features().len(),
                    gated: false,
                    failed: true,
                }
            }
        };

        self.pose = &self.pose * &step.increment;
        step
    }

    /// The integrated raw VO estimate, before any map correction.
    pub fn pose(&self) -> &Transform {
        &self.pose
    }
}
