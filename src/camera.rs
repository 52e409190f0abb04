use nalgebra::Vector3;

use crate::error::SlamError;

/// Pin-hole camera intrinsics.
#[derive(Clone, Debug)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Projects a point in the camera frame onto the image plane.
    ///
    /// The point must have positive depth.
    pub fn project(&self, point: &Vector3<f64>) -> (f64, f64) {
        (
            point.x * self.fx / point.z + self.cx,
            point.y * self.fy / point.z + self.cy,
        )
    }

    /// Back-projects pixel `(u, v)` with metric depth `z` into the camera frame.
    pub fn backproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }
}

/// The calibrated depth sensor: intrinsics, image extent and the scale that
/// converts raw depth pixels to meters (`z = pixel / depth_scale`).
#[derive(Clone, Debug)]
pub struct DepthSensorModel {
    pub intrinsics: Intrinsics,
    pub width: usize,
    pub height: usize,
    pub depth_scale: f64,
}

impl DepthSensorModel {
    pub fn new(
        intrinsics: Intrinsics,
        width: usize,
        height: usize,
        depth_scale: f64,
    ) -> Result<Self, SlamError> {
        if intrinsics.fx <= 0.0 || intrinsics.fy <= 0.0 {
            return Err(SlamError::Calibration(format!(
                "non-positive focal length: fx={}, fy={}",
                intrinsics.fx, intrinsics.fy
            )));
        }
        if !depth_scale.is_finite() || depth_scale <= 0.0 {
            return Err(SlamError::Calibration(format!(
                "invalid depth scale: {depth_scale}"
            )));
        }
        if width == 0 || height == 0 {
            return Err(SlamError::Calibration(format!(
                "empty image extent: {width}x{height}"
            )));
        }
        Ok(Self {
            intrinsics,
            width,
            height,
            depth_scale,
        })
    }

    pub fn depth_to_meters(&self, pixel: u16) -> f64 {
        f64::from(pixel) / self.depth_scale
    }

    pub fn project(&self, point: &Vector3<f64>) -> (f64, f64) {
        self.intrinsics.project(point)
    }

    pub fn backproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        self.intrinsics.backproject(u, v, z)
    }

    /// Whether a camera-frame point lands inside the image with positive depth.
    pub fn in_frustum(&self, point: &Vector3<f64>) -> bool {
        if point.z <= 0.0 {
            return false;
        }
        let (u, v) = self.project(point);
        u >= 0.0 && u < self.width as f64 && v >= 0.0 && v < self.height as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::{fixture, rstest};

    #[fixture]
    fn kinect() -> DepthSensorModel {
        DepthSensorModel::new(Intrinsics::new(525.0, 525.0, 319.5, 239.5), 640, 480, 5000.0)
            .unwrap()
    }

    #[rstest]
    fn test_projection_inverse_projection_identity(kinect: DepthSensorModel) {
        for point in [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(0.5, -0.25, 2.0),
            Vector3::new(-1.2, 0.8, 4.5),
        ] {
            let (u, v) = kinect.project(&point);
            let back = kinect.backproject(u, v, point.z);
            assert_relative_eq!(back, point, epsilon = 1e-9);
        }
    }

    #[rstest]
    fn test_depth_scale(kinect: DepthSensorModel) {
        assert_relative_eq!(kinect.depth_to_meters(5000), 1.0);
        assert_relative_eq!(kinect.depth_to_meters(12500), 2.5);
    }

    #[rstest]
    fn test_frustum(kinect: DepthSensorModel) {
        assert!(kinect.in_frustum(&Vector3::new(0.0, 0.0, 2.0)));
        assert!(!kinect.in_frustum(&Vector3::new(0.0, 0.0, -2.0)));
        assert!(!kinect.in_frustum(&Vector3::new(50.0, 0.0, 2.0)));
    }

    #[test]
    fn test_rejects_bad_calibration() {
        assert!(DepthSensorModel::new(Intrinsics::new(0.0, 525.0, 319.5, 239.5), 640, 480, 5000.0)
            .is_err());
        assert!(DepthSensorModel::new(Intrinsics::new(525.0, 525.0, 319.5, 239.5), 640, 480, 0.0)
            .is_err());
        assert!(
            DepthSensorModel::new(Intrinsics::new(525.0, 525.0, 319.5, 239.5), 0, 480, 5000.0)
                .is_err()
        );
    }
}
