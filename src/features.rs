use nalgebra::Vector3;

use crate::{frame::SensorFrame, transform::Transform};

/// One observation of a landmark from a specific keyframe.
#[derive(Clone, Debug)]
pub struct ViewDescriptor {
    /// Pixel position as detected, before undistortion.
    pub distorted: (f64, f64),
    /// Pixel position after undistortion.
    pub undistorted: (f64, f64),
    /// 3D position in the observing keyframe's local frame.
    pub local_position: Vector3<f64>,
    /// Opaque descriptor bytes from the feature engine.
    pub descriptor: Vec<u8>,
    /// Detector pyramid octave.
    pub octave: u32,
    /// Detector response strength.
    pub response: f64,
}

/// Detector output for one frame, in detector order. All columns run
/// parallel to each other.
#[derive(Clone, Debug, Default)]
pub struct FeatureSet {
    pub distorted: Vec<(f64, f64)>,
    pub undistorted: Vec<(f64, f64)>,
    /// 3D positions in the camera frame of the detection.
    pub points: Vec<Vector3<f64>>,
    pub descriptors: Vec<Vec<u8>>,
    pub octaves: Vec<u32>,
    pub responses: Vec<f64>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Packages detection `index` as a view descriptor.
    pub fn view(&self, index: usize) -> ViewDescriptor {
        ViewDescriptor {
            distorted: self.distorted[index],
            undistorted: self.undistorted[index],
            local_position: self.points[index],
            descriptor: self.descriptors[index].clone(),
            octave: self.octaves[index],
            response: self.responses[index],
        }
    }
}

/// A landmark candidate produced by the admission policy. The position is in
/// the spawning keyframe's local frame; the map converts it to world
/// coordinates when the landmark is created.
#[derive(Clone, Debug)]
pub struct NewLandmark {
    pub position_local: Vector3<f64>,
    pub undistorted: (f64, f64),
    pub view: ViewDescriptor,
}

/// A matched observation of an existing landmark, ready to become a
/// pose-landmark edge.
#[derive(Clone, Debug)]
pub struct Measurement {
    pub landmark_id: u32,
    /// The observing keyframe.
    pub keyframe_id: u32,
    /// 3D position in the observing keyframe's local frame.
    pub position_local: Vector3<f64>,
    /// The matched detection, merged into the landmark's view set.
    pub view: Option<ViewDescriptor>,
    /// Surface normal, filled only when the uncertainty model is enabled.
    pub normal: Option<Vector3<f64>>,
    /// RGB gradient, filled only when the uncertainty model is enabled.
    pub rgb_gradient: Option<Vector3<f64>>,
}

/// Frame-to-frame motion estimate from the engine's RANSAC solver.
#[derive(Clone, Debug)]
pub struct VoEstimate {
    /// Rigid increment `prev_from_current`, composed as
    /// `world_from_cam * increment`.
    pub increment: Transform,
    pub inlier_ratio: f64,
    pub inlier_count: usize,
}

/// Result of matching visible landmarks against the current frame.
#[derive(Clone, Debug, Default)]
pub struct MatchOutcome {
    pub measurements: Vec<Measurement>,
    pub inlier_ratio: f64,
}

/// Working record for one visible landmark during the per-frame map cycle.
/// Produced from a map snapshot; the position is rewritten from world to
/// current-camera coordinates by measurement ingestion.
#[derive(Clone, Debug)]
pub struct VisibleLandmark {
    pub id: u32,
    pub position: Vector3<f64>,
    /// Projection onto the current image.
    pub projection: (f64, f64),
    /// Descriptor of the nearest observing view.
    pub descriptor: Vec<u8>,
    pub octave: u32,
}

/// The feature detector, descriptor extractor and RANSAC matcher. Opaque to
/// the core except for this interface; implementations keep their own state
/// for the current frame.
pub trait FeatureEngine: Send {
    /// Detects and describes features in the first frame. Returns the number
    /// of detections, retrievable through [`FeatureEngine::features`].
    fn detect_init(&mut self, frame: &SensorFrame) -> usize;

    /// Detector output for the most recently processed frame.
    fn features(&self) -> &FeatureSet;

    /// Detects features in `frame` and solves the rigid motion against the
    /// previous frame. `None` signals insufficient features or RANSAC
    /// failure; the caller recovers with an identity increment.
    fn run_vo(&mut self, frame: &SensorFrame) -> Option<VoEstimate>;

    /// Matches visible landmarks to the current frame's detections in a
    /// sphere around each projected landmark. `attempt` starts at 1 and grows
    /// on retries; implementations widen the search sphere with it.
    fn match_map(
        &mut self,
        frame: &SensorFrame,
        visible: &[VisibleLandmark],
        keyframe_id: u32,
        attempt: u32,
    ) -> MatchOutcome;

    /// Fills surface normals on the given measurements from the depth image.
    fn compute_normals(&self, frame: &SensorFrame, measurements: &mut [Measurement]);

    /// Fills RGB gradients on the given measurements.
    fn compute_rgb_gradients(&self, frame: &SensorFrame, measurements: &mut [Measurement]);
}

/// Normalized Hamming distance between two descriptors, in `[0, 1]`.
/// Descriptors of unequal length compare as maximally distant.
pub fn descriptor_distance(lfs: &[u8], rfs: &[u8]) -> f64 {
    if lfs.len() != rfs.len() || lfs.is_empty() {
        return 1.0;
    }
    let bits = (lfs.len() * 8) as f64;
    let differing: u32 = lfs
        .iter()
        .zip(rfs.iter())
        .map(|(a, b)| (a ^ b).count_ones())
        .sum();
    f64::from(differing) / bits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_distance() {
        let a = vec![0b1111_0000u8, 0x00];
        let b = vec![0b0000_0000u8, 0x00];
        assert_eq!(descriptor_distance(&a, &a), 0.0);
        assert_eq!(descriptor_distance(&a, &b), 4.0 / 16.0);
        assert_eq!(descriptor_distance(&a, &[0u8]), 1.0);
    }
}
