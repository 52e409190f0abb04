use ndarray::{Array2, Array3};

use crate::{camera::Intrinsics, error::FrameFault, transform::Transform};

/// One time-stamped RGB-D pair as delivered by a [`FrameSource`].
pub struct SensorFrame {
    pub timestamp: f64,
    pub color: Array3<u8>,
    pub depth: Array2<u16>,
    pub depth_scale: f64,
}

impl SensorFrame {
    pub fn new(timestamp: f64, color: Array3<u8>, depth: Array2<u16>, depth_scale: f64) -> Self {
        Self {
            timestamp,
            color,
            depth,
            depth_scale,
        }
    }

    pub fn width(&self) -> usize {
        self.color.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.color.shape()[0]
    }
}

/// Source of the frame stream. Implementations block in [`FrameSource::grab`]
/// until a frame is available or the stream ends.
pub trait FrameSource: Send {
    /// Fetches the next frame. `Ok(None)` signals end of stream. `Err` is a
    /// transient decode fault: the caller skips the frame without advancing
    /// its frame counter.
    fn grab(&mut self) -> Result<Option<SensorFrame>, FrameFault>;

    fn intrinsics(&self) -> Intrinsics;

    fn depth_scale(&self) -> f64;

    /// Image extent as `(width, height)`.
    fn extent(&self) -> (usize, usize);

    /// Pose of the sensor at the first frame, in the world frame.
    fn starting_pose(&self) -> Transform {
        Transform::eye()
    }
}
