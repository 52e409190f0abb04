use clap::Parser;
use nalgebra::Vector3;
use ordered_float::OrderedFloat;

use mapslam::{
    camera::DepthSensorModel,
    config::SlamConfig,
    error::SlamError,
    features::{
        FeatureEngine, FeatureSet, MatchOutcome, Measurement, VisibleLandmark, VoEstimate,
    },
    frame::{FrameSource, SensorFrame},
    io::TumFrameSource,
    pipeline::Pipeline,
    trajectory::{read_freiburg, Trajectory},
    transform::Transform,
};

/// Replays a recorded trajectory through the mapping pipeline (the inverse
/// SLAM problem): motion comes from the reference file, features from a
/// regular grid over the depth image with color-patch descriptors. The
/// live detector/matcher engine plugs in through the same interface.
struct ReplayEngine {
    trajectory: Trajectory,
    sensor: DepthSensorModel,
    features: FeatureSet,
    grid_step: usize,
    min_depth: f64,
    max_depth: f64,
}

impl ReplayEngine {
    fn new(trajectory: Trajectory, sensor: DepthSensorModel, config: &SlamConfig) -> Self {
        Self {
            trajectory,
            sensor,
            features: FeatureSet::default(),
            grid_step: 20,
            min_depth: config.min_depth,
            max_depth: config.max_depth_admit,
        }
    }

    fn index_of(&self, timestamp: f64) -> Option<usize> {
        let (index, nearest) = self
            .trajectory
            .timestamps
            .iter()
            .copied()
            .enumerate()
            .min_by_key(|&(_, reference)| OrderedFloat((reference - timestamp).abs()))?;
        if (nearest - timestamp).abs() < 0.1 {
            Some(index)
        } else {
            None
        }
    }

    fn patch_descriptor(frame: &SensorFrame, u: usize, v: usize) -> Vec<u8> {
        let (height, width) = (frame.height(), frame.width());
        let mut descriptor = Vec::with_capacity(32);
        for dv in 0..3usize {
            for du in 0..3usize {
                let y = (v + dv).min(height - 1);
                let x = (u + du).min(width - 1);
                for channel in 0..3 {
                    descriptor.push(frame.color[[y, x, channel]]);
                }
            }
        }
        descriptor.resize(32, 0);
        descriptor
    }

    fn detect(&mut self, frame: &SensorFrame) {
        let mut features = FeatureSet::default();
        for v in (0..frame.height()).step_by(self.grid_step) {
            for u in (0..frame.width()).step_by(self.grid_step) {
                let z = f64::from(frame.depth[[v, u]]) / frame.depth_scale;
                if z < self.min_depth || z > self.max_depth {
                    continue;
                }
                let pixel = (u as f64, v as f64);
                features.distorted.push(pixel);
                features.undistorted.push(pixel);
                features
                    .points
                    .push(self.sensor.backproject(pixel.0, pixel.1, z));
                features.descriptors.push(Self::patch_descriptor(frame, u, v));
                features.octaves.push(0);
                features.responses.push(1.0);
            }
        }
        self.features = features;
    }
}

impl FeatureEngine for ReplayEngine {
    fn detect_init(&mut self, frame: &SensorFrame) -> usize {
        self.detect(frame);
        self.features.len()
    }

    fn features(&self) -> &FeatureSet {
        &self.features
    }

    fn run_vo(&mut self, frame: &SensorFrame) -> Option<VoEstimate> {
        self.detect(frame);
        let index = self.index_of(frame.timestamp)?;
        if index == 0 {
            return None;
        }
        let increment =
            &self.trajectory.poses[index - 1].inverse() * &self.trajectory.poses[index];
        Some(VoEstimate {
            inlier_ratio: 1.0,
            inlier_count: self.features.len(),
            increment,
        })
    }

    fn match_map(
        &mut self,
        _frame: &SensorFrame,
        visible: &[VisibleLandmark],
        keyframe_id: u32,
        attempt: u32,
    ) -> MatchOutcome {
        let radius = 10.0 * f64::from(attempt);
        let measurements: Vec<Measurement> = visible
            .iter()
            .filter_map(|landmark| {
                let (index, distance) = (0..self.features.len())
                    .map(|index| {
                        let (u, v) = self.features.undistorted[index];
                        let du = u - landmark.projection.0;
                        let dv = v - landmark.projection.1;
                        (index, (du * du + dv * dv).sqrt())
                    })
                    .min_by_key(|&(_, distance)| OrderedFloat(distance))?;
                if distance > radius {
                    return None;
                }
                Some(Measurement {
                    landmark_id: landmark.id,
                    keyframe_id,
                    position_local: self.features.points[index],
                    view: Some(self.features.view(index)),
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
        MatchOutcome {
            measurements,
            inlier_ratio,
        }
    }

    fn compute_normals(&self, _frame: &SensorFrame, measurements: &mut [Measurement]) {
        for measurement in measurements {
            let norm = measurement.position_local.norm();
            if norm > 0.0 {
                measurement.normal = Some(-measurement.position_local / norm);
            }
        }
    }

    fn compute_rgb_gradients(&self, _frame: &SensorFrame, measurements: &mut [Measurement]) {
        for measurement in measurements {
            measurement.rgb_gradient = Some(Vector3::zeros());
        }
    }
}

#[derive(Parser)]
#[clap(about = "RGB-D SLAM over a TUM-layout dataset, replaying its reference trajectory")]
struct Args {
    /// Path to the dataset directory (rgb/, depth/, groundtruth.txt)
    dataset: String,
    /// JSON configuration file; defaults apply when omitted
    #[clap(long, short)]
    config: Option<String>,
    /// Directory for VO_trajectory.res, graph_trajectory.res and logs
    #[clap(long, short, default_value = ".")]
    output: String,
}

fn run(args: &Args) -> Result<(), SlamError> {
    let config = match &args.config {
        Some(path) => SlamConfig::load(path)?,
        None => SlamConfig::default(),
    };

    let source = TumFrameSource::load(&args.dataset)?;
    let (width, height) = source.extent();
    let sensor = DepthSensorModel::new(source.intrinsics(), width, height, source.depth_scale())?;

    let reference = read_freiburg(
        std::path::Path::new(&args.dataset).join("groundtruth.txt"),
    )
    .map_err(|_| {
        SlamError::Config(format!(
            "replay needs {}/groundtruth.txt as the motion reference",
            args.dataset
        ))
    })?;
    let engine = ReplayEngine::new(reference, sensor, &config);

    let mut pipeline = Pipeline::new(config, Box::new(source), Box::new(engine), &args.output)?;
    pipeline.initialize();
    pipeline.run()?;
    let stats = pipeline.finalize()?;

    println!(
        "processed {} frames at {:.1} fps ({} faults, {} VO failures)",
        stats.frames, stats.fps, stats.frame_faults, stats.vo_failures
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("slam: {err}");
        let code = match err {
            SlamError::Config(_) | SlamError::Calibration(_) => 2,
            _ => 1,
        };
        std::process::exit(code);
    }
}
