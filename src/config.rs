use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::SlamError;

/// When the pose-graph optimizer runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerMode {
    /// No optimization at all.
    Off,
    /// Concurrent with acquisition.
    On,
    /// Concurrent, with a Cauchy robust kernel.
    OnRobust,
    /// Deferred until the frame stream ends.
    AtEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Off,
    On,
}

impl WorkerMode {
    pub fn enabled(self) -> bool {
        self == WorkerMode::On
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Upper bound on Gauss-Seidel sweeps per optimization run.
    pub max_sweeps: usize,
    /// Publish refined estimates every this many sweeps.
    pub flush_every: usize,
    /// Converged when the total squared residual changes less than this
    /// over one sweep.
    pub convergence_eps: f64,
    /// Scale of the Cauchy kernel in `on_robust` mode.
    pub cauchy_scale: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_sweeps: 100,
            flush_every: 10,
            convergence_eps: 1e-6,
            cauchy_scale: 1.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopClosureConfig {
    /// Minimum keyframe-id gap between candidate pair members.
    pub min_gap: u32,
    /// Descriptor-bag similarity needed before the full matcher runs.
    pub min_probability: f64,
    /// Inlier ratio of the rigid fit needed to accept the proposed edge.
    pub min_matching_ratio: f64,
    /// Minimum shared landmark correspondences for a rigid fit.
    pub min_shared_landmarks: usize,
    /// Descriptor distance below which two views are considered the same
    /// landmark during the candidate sweep.
    pub max_descriptor_distance: f64,
    /// Residual (meters) below which a correspondence counts as an inlier
    /// of the fitted transform.
    pub inlier_radius: f64,
}

impl Default for LoopClosureConfig {
    fn default() -> Self {
        Self {
            min_gap: 40,
            min_probability: 0.5,
            min_matching_ratio: 0.4,
            min_shared_landmarks: 6,
            max_descriptor_distance: 0.15,
            inlier_radius: 0.05,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MapManagerConfig {
    /// Landmarks seen from fewer keyframes than this are prune candidates.
    pub min_views: usize,
    /// A prune candidate is removed once this many keyframes passed since
    /// its last observation.
    pub stale_age: u32,
    /// Landmarks closer than this are merged.
    pub merge_distance: f64,
}

impl Default for MapManagerConfig {
    fn default() -> Self {
        Self {
            min_views: 2,
            stale_age: 30,
            merge_distance: 0.025,
        }
    }
}

/// All recognized options with their defaults. Loaded from JSON by the
/// binary; every field has a default so partial files are fine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SlamConfig {
    /// Diagnostic verbosity. Zero keeps the per-frame loop quiet.
    pub verbose: u32,
    /// Run visual odometry only and skip the map entirely.
    pub only_vo: bool,
    /// Retain rgb/depth images on every keyframe.
    pub keep_frames: bool,

    pub optimizer_mode: OptimizerMode,
    pub map_manager_mode: WorkerMode,
    pub loop_closure_mode: WorkerMode,

    /// Spawn new landmarks when fewer than this many are visible.
    pub min_visible: usize,
    /// ... or when fewer than this many were matched,
    pub min_measurements: usize,
    /// unless at least this many are visible anyway.
    pub no_add_ceiling: usize,
    /// Upper bound on landmarks spawned from a single frame.
    pub max_once_add: usize,
    /// Minimum 3D separation between landmarks, meters.
    pub d_euc: f64,
    /// Minimum image separation between landmarks, pixels.
    pub d_img: f64,

    /// Below this many map measurements the frame also gets an odometry
    /// pose-pose edge.
    pub max_pose_pose_measurements: usize,
    /// Above this many map measurements the frame gets pose-landmark edges.
    pub min_pose_feature_measurements: usize,

    /// VO increments translating farther than this are rejected as erratic.
    pub max_translation_per_frame: f64,
    /// Observation-angle budget for nearest-frame selection, radians.
    pub max_angle_between_frames: f64,

    /// Admissible depth window for new landmarks, meters.
    pub min_depth: f64,
    pub max_depth_admit: f64,
    /// Landmarks farther than this are unreliable for matching.
    pub max_depth_match: f64,

    /// Keyframes sharing at least this many landmarks are covisible.
    pub covisibility_min_shared: usize,
    /// Attach normals and RGB gradients to measurements.
    pub use_uncertainty: bool,

    pub optimizer: OptimizerConfig,
    pub loop_closure: LoopClosureConfig,
    pub map_manager: MapManagerConfig,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            only_vo: false,
            keep_frames: true,
            optimizer_mode: OptimizerMode::On,
            map_manager_mode: WorkerMode::On,
            loop_closure_mode: WorkerMode::Off,
            min_visible: 25,
            min_measurements: 15,
            no_add_ceiling: 50,
            max_once_add: 50,
            d_euc: 0.05,
            d_img: 15.0,
            max_pose_pose_measurements: 10,
            min_pose_feature_measurements: 5,
            max_translation_per_frame: 0.10,
            max_angle_between_frames: 0.60,
            min_depth: 0.8,
            max_depth_admit: 6.0,
            max_depth_match: 5.0,
            covisibility_min_shared: 3,
            use_uncertainty: false,
            optimizer: OptimizerConfig::default(),
            loop_closure: LoopClosureConfig::default(),
            map_manager: MapManagerConfig::default(),
        }
    }
}

impl SlamConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SlamError> {
        let contents = std::fs::read_to_string(path)?;
        let config: SlamConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SlamError> {
        if self.min_depth <= 0.0 || self.max_depth_admit <= self.min_depth {
            return Err(SlamError::Config(format!(
                "bad depth window: [{}, {}]",
                self.min_depth, self.max_depth_admit
            )));
        }
        if self.max_depth_match <= self.min_depth {
            return Err(SlamError::Config(format!(
                "matching depth ceiling {} below minimum depth {}",
                self.max_depth_match, self.min_depth
            )));
        }
        if self.max_translation_per_frame <= 0.0 {
            return Err(SlamError::Config(
                "max_translation_per_frame must be positive".to_string(),
            ));
        }
        if !(0.0..=std::f64::consts::PI).contains(&self.max_angle_between_frames) {
            return Err(SlamError::Config(format!(
                "max_angle_between_frames out of range: {}",
                self.max_angle_between_frames
            )));
        }
        if self.d_euc < 0.0 || self.d_img < 0.0 {
            return Err(SlamError::Config(
                "separation thresholds must be non-negative".to_string(),
            ));
        }
        if self.optimizer.flush_every == 0 {
            return Err(SlamError::Config(
                "optimizer.flush_every must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        SlamConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let config: SlamConfig =
            serde_json::from_str(r#"{"only_vo": true, "optimizer_mode": "at_end"}"#).unwrap();
        assert!(config.only_vo);
        assert_eq!(config.optimizer_mode, OptimizerMode::AtEnd);
        assert_eq!(config.min_pose_feature_measurements, 5);
    }

    #[test]
    fn test_load_rejects_bad_depth_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slam.json");
        std::fs::write(&path, r#"{"min_depth": 2.0, "max_depth_admit": 1.0}"#).unwrap();
        match SlamConfig::load(&path) {
            Err(SlamError::Config(_)) => {}
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn test_mode_spelling() {
        let config: SlamConfig =
            serde_json::from_str(r#"{"optimizer_mode": "on_robust", "loop_closure_mode": "on"}"#)
                .unwrap();
        assert_eq!(config.optimizer_mode, OptimizerMode::OnRobust);
        assert!(config.loop_closure_mode.enabled());
    }
}
