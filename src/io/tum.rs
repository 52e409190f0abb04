use std::path::{Path, PathBuf};

use nshare::ToNdarray2;
use serde_derive::Deserialize;

use crate::{
    camera::Intrinsics,
    error::{FrameFault, SlamError},
    frame::{FrameSource, SensorFrame},
    trajectory::read_freiburg,
    transform::Transform,
};

use super::rgb_into_array3;

/// Calibration of a TUM-layout dataset. The defaults are the Freiburg
/// Kinect values; a `calibration.json` in the dataset directory overrides
/// them.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TumCalibration {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: usize,
    pub height: usize,
    pub depth_scale: f64,
}

impl Default for TumCalibration {
    fn default() -> Self {
        Self {
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            width: 640,
            height: 480,
            depth_scale: 5000.0,
        }
    }
}

/// Frame source over a TUM RGB-D directory: `rgb/*.png` color frames and
/// `depth/*.png` 16-bit depth frames, timestamps encoded in the file names.
/// When a `groundtruth.txt` is present its first pose anchors the run.
pub struct TumFrameSource {
    rgb_paths: Vec<PathBuf>,
    depth_paths: Vec<PathBuf>,
    timestamps: Vec<f64>,
    calibration: TumCalibration,
    starting_pose: Transform,
    next: usize,
}

fn sorted_pngs(dir: &Path) -> Result<Vec<PathBuf>, SlamError> {
    let pattern = dir.join("*.png");
    let pattern = pattern
        .to_str()
        .ok_or_else(|| SlamError::Parse(format!("non-utf8 dataset path: {dir:?}")))?;
    let mut paths: Vec<PathBuf> = glob::glob(pattern)
        .map_err(|err| SlamError::Parse(err.to_string()))?
        .filter_map(Result::ok)
        .collect();
    paths.sort();
    Ok(paths)
}

fn timestamp_of(path: &Path, fallback_index: usize) -> f64 {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<f64>().ok())
        .unwrap_or(fallback_index as f64 / 30.0)
}

impl TumFrameSource {
    pub fn load(base_dir: &str) -> Result<Self, SlamError> {
        let base = PathBuf::from(base_dir);
        let rgb_paths = sorted_pngs(&base.join("rgb"))?;
        let depth_paths = sorted_pngs(&base.join("depth"))?;

        if rgb_paths.is_empty() {
            return Err(SlamError::Parse(format!(
                "no rgb frames under {base_dir}/rgb"
            )));
        }
        if rgb_paths.len() != depth_paths.len() {
            return Err(SlamError::Parse(format!(
                "{} rgb frames but {} depth frames under {base_dir}",
                rgb_paths.len(),
                depth_paths.len()
            )));
        }

        let calibration = match std::fs::read_to_string(base.join("calibration.json")) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|err| SlamError::Calibration(err.to_string()))?,
            Err(_) => TumCalibration::default(),
        };

        let starting_pose = match read_freiburg(base.join("groundtruth.txt")) {
            Ok(trajectory) if !trajectory.is_empty() => trajectory.poses[0].clone(),
            _ => Transform::eye(),
        };

        let timestamps = rgb_paths
            .iter()
            .enumerate()
            .map(|(index, path)| timestamp_of(path, index))
            .collect();

        Ok(Self {
            rgb_paths,
            depth_paths,
            timestamps,
            calibration,
            starting_pose,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.rgb_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rgb_paths.is_empty()
    }
}

impl FrameSource for TumFrameSource {
    fn grab(&mut self) -> Result<Option<SensorFrame>, FrameFault> {
        if self.next >= self.rgb_paths.len() {
            return Ok(None);
        }
        let index = self.next;
        self.next += 1;

        let color = image::open(&self.rgb_paths[index])
            .map_err(|err| FrameFault(format!("rgb frame {index}: {err}")))?
            .into_rgb8();
        let depth = image::open(&self.depth_paths[index])
            .map_err(|err| FrameFault(format!("depth frame {index}: {err}")))?
            .into_luma16()
            .into_ndarray2();

        Ok(Some(SensorFrame::new(
            self.timestamps[index],
            rgb_into_array3(color),
            depth,
            self.calibration.depth_scale,
        )))
    }

    fn intrinsics(&self) -> Intrinsics {
        Intrinsics::new(
            self.calibration.fx,
            self.calibration.fy,
            self.calibration.cx,
            self.calibration.cy,
        )
    }

    fn depth_scale(&self) -> f64 {
        self.calibration.depth_scale
    }

    fn extent(&self) -> (usize, usize) {
        (self.calibration.width, self.calibration.height)
    }

    fn starting_pose(&self) -> Transform {
        self.starting_pose.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb};

    fn write_sample_dataset(dir: &Path, frames: usize) {
        std::fs::create_dir_all(dir.join("rgb")).unwrap();
        std::fs::create_dir_all(dir.join("depth")).unwrap();
        for index in 0..frames {
            let stamp = format!("{:.6}", 1000.0 + index as f64 / 30.0);
            let rgb: ImageBuffer<Rgb<u8>, Vec<u8>> =
                ImageBuffer::from_fn(8, 6, |x, y| Rgb([x as u8, y as u8, index as u8]));
            rgb.save(dir.join("rgb").join(format!("{stamp}.png"))).unwrap();
            let depth: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(8, 6, |_, _| Luma([5000u16]));
            depth
                .save(dir.join("depth").join(format!("{stamp}.png")))
                .unwrap();
        }
    }

    #[test]
    fn test_load_and_grab() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_dataset(dir.path(), 3);

        let mut source = TumFrameSource::load(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(source.len(), 3);

        let frame = source.grab().unwrap().unwrap();
        assert!((frame.timestamp - 1000.0).abs() < 1e-6);
        assert_eq!(frame.color.shape(), &[6, 8, 3]);
        assert_eq!(frame.depth.shape(), &[6, 8]);
        assert_eq!(frame.depth[[0, 0]], 5000);

        let _ = source.grab().unwrap().unwrap();
        let _ = source.grab().unwrap().unwrap();
        assert!(source.grab().unwrap().is_none());
    }

    #[test]
    fn test_mismatched_frame_counts_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_dataset(dir.path(), 2);
        std::fs::remove_file(
            sorted_pngs(&dir.path().join("depth")).unwrap()[0].clone(),
        )
        .unwrap();

        assert!(TumFrameSource::load(dir.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_calibration_override() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_dataset(dir.path(), 1);
        std::fs::write(
            dir.path().join("calibration.json"),
            r#"{"fx": 500.0, "depth_scale": 1000.0}"#,
        )
        .unwrap();

        let source = TumFrameSource::load(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(source.intrinsics().fx, 500.0);
        assert_eq!(source.depth_scale(), 1000.0);
        assert_eq!(source.extent(), (640, 480));
    }

    #[test]
    fn test_starting_pose_from_groundtruth() {
        let dir = tempfile::tempdir().unwrap();
        write_sample_dataset(dir.path(), 1);
        std::fs::write(dir.path().join("groundtruth.txt"), "1000.0 1 2 3 0 0 0 1\n").unwrap();

        let source = TumFrameSource::load(dir.path().to_str().unwrap()).unwrap();
        assert!(
            (source.starting_pose().translation() - nalgebra::Vector3::new(1.0, 2.0, 3.0)).norm()
                < 1e-9
        );
    }
}
