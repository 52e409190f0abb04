use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::{
    admission,
    camera::DepthSensorModel,
    config::{OptimizerMode, SlamConfig},
    error::SlamError,
    features::FeatureEngine,
    frame::{FrameSource, SensorFrame},
    map::FeaturesMap,
    matching,
    odometry::{VoDriver, VoStep},
    optim::RobustKernel,
    trajectory::{write_freiburg, Trajectory},
    workers::{
        optimize_once, spawn_loop_closure, spawn_map_manager, spawn_optimizer, LoopClosureShared,
        Worker,
    },
};

/// Per-run logs and failure counters, reported at finalize.
#[derive(Clone, Debug, Default)]
pub struct RunStats {
    /// Frames processed (faulted frames do not count).
    pub frames: usize,
    pub frame_faults: usize,
    pub vo_failures: usize,
    pub gated_increments: usize,
    /// Per-frame VO inlier ratio, `-1.0` for failed estimates.
    pub vo_inlier_ratios: Vec<f64>,
    pub vo_feature_counts: Vec<usize>,
    /// Visible landmarks per map cycle.
    pub visible_counts: Vec<usize>,
    /// Matched measurements per map cycle.
    pub measurement_counts: Vec<usize>,
    /// Map-matching inlier ratio per map cycle.
    pub match_ratios: Vec<f64>,
    /// Landmark count after each frame.
    pub map_sizes: Vec<usize>,
    pub loop_closures_accepted: usize,
    pub loop_closures_spurious: usize,
    pub fps: f64,
}

/// The tracking-and-mapping pipeline: owns the frame source, the feature
/// engine, the map and the background workers.
///
/// Lifecycle: `new` (configure) → [`Pipeline::initialize`] →
/// [`Pipeline::run`] → [`Pipeline::finalize`].
pub struct Pipeline {
    config: SlamConfig,
    source: Box<dyn FrameSource>,
    engine: Box<dyn FeatureEngine>,
    sensor: DepthSensorModel,
    map: Arc<FeaturesMap>,
    vo: VoDriver,
    vo_trajectory: Trajectory,
    stats: RunStats,
    output_dir: PathBuf,
    started: Option<Instant>,
    optimizer: Option<Worker>,
    loop_closure: Option<Worker>,
    map_manager: Option<Worker>,
    loop_closure_shared: Arc<LoopClosureShared>,
}

impl Pipeline {
    /// Validates the configuration and calibration. The two fatal error
    /// paths of the system both surface here.
    pub fn new(
        config: SlamConfig,
        source: Box<dyn FrameSource>,
        engine: Box<dyn FeatureEngine>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<Self, SlamError> {
        config.validate()?;
        let (width, height) = source.extent();
        let sensor =
            DepthSensorModel::new(source.intrinsics(), width, height, source.depth_scale())?;
        let vo = VoDriver::new(source.starting_pose(), config.max_translation_per_frame);

        Ok(Self {
            config,
            source,
            engine,
            sensor,
            map: Arc::new(FeaturesMap::new()),
            vo,
            vo_trajectory: Trajectory::new(),
            stats: RunStats::default(),
            output_dir: output_dir.into(),
            started: None,
            optimizer: None,
            loop_closure: None,
            map_manager: None,
            loop_closure_shared: Arc::new(LoopClosureShared::default()),
        })
    }

    fn kernel(&self) -> RobustKernel {
        match self.config.optimizer_mode {
            OptimizerMode::OnRobust => RobustKernel::Cauchy(self.config.optimizer.cauchy_scale),
            _ => RobustKernel::None,
        }
    }

    /// Starts the background workers the configuration asks for. In
    /// `only_vo` mode the map is untouched and no worker runs.
    pub fn initialize(&mut self) {
        if self.config.only_vo {
            return;
        }

        match self.config.optimizer_mode {
            OptimizerMode::On | OptimizerMode::OnRobust => {
                self.optimizer = Some(spawn_optimizer(
                    self.map.clone(),
                    self.config.optimizer.clone(),
                    self.kernel(),
                ));
            }
            OptimizerMode::Off | OptimizerMode::AtEnd => {}
        }
        if self.config.map_manager_mode.enabled() {
            self.map_manager = Some(spawn_map_manager(
                self.map.clone(),
                self.config.map_manager.clone(),
            ));
        }
        if self.config.loop_closure_mode.enabled() {
            self.loop_closure = Some(spawn_loop_closure(
                self.map.clone(),
                self.config.loop_closure.clone(),
                self.loop_closure_shared.clone(),
            ));
        }
    }

    /// Drives the per-frame loop until the source reports end of stream.
    /// Transient frame faults are skipped without advancing the frame
    /// counter; the loop never terminates on recoverable errors.
    pub fn run(&mut self) -> Result<(), SlamError> {
        self.started = Some(Instant::now());
        loop {
            let frame = match self.source.grab() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(fault) => {
                    log::warn!("skipping frame: {fault}");
                    self.stats.frame_faults += 1;
                    continue;
                }
            };
            self.process_frame(&frame);
        }
        Ok(())
    }

    fn keyframe_images(
        &self,
        frame: &SensorFrame,
    ) -> (
        Option<ndarray::Array3<u8>>,
        Option<ndarray::Array2<u16>>,
    ) {
        if self.config.keep_frames {
            (Some(frame.color.clone()), Some(frame.depth.clone()))
        } else {
            (None, None)
        }
    }

    fn process_frame(&mut self, frame: &SensorFrame) {
        if self.config.verbose > 0 {
            log::info!("----- frame {} -----", self.stats.frames);
        }

        if self.stats.frames == 0 {
            self.process_first_frame(frame);
        } else {
            let step = self.vo.step(self.engine.as_mut(), frame);
            self.stats.vo_inlier_ratios.push(step.inlier_ratio);
            self.stats.vo_feature_counts.push(step.feature_count);
            if !self.config.only_vo {
                self.map_cycle(frame, &step);
            }
        }

        self.vo_trajectory.push(self.vo.pose().clone(), frame.timestamp);
        self.stats.map_sizes.push(self.map.landmark_count());
        self.stats.frames += 1;
    }

    fn process_first_frame(&mut self, frame: &SensorFrame) {
        let count = self.vo.first_frame(self.engine.as_mut(), frame);
        self.stats.vo_feature_counts.push(count);

        if self.config.only_vo {
            return;
        }

        let (color, depth) = self.keyframe_images(frame);
        let keyframe_id =
            self.map
                .add_pose(self.vo.pose().clone(), frame.timestamp, color, depth);

        let candidates =
            admission::select_new_landmarks(self.engine.features(), &[], &self.config);
        let added = self.map.add_features(candidates, keyframe_id).len();
        log::debug!("first frame admitted {added} landmarks");
    }

    fn map_cycle(&mut self, frame: &SensorFrame, step: &VoStep) {
        let (color, depth) = self.keyframe_images(frame);
        let keyframe_id =
            self.map
                .add_pose(step.increment.clone(), frame.timestamp, color, depth);

        let ingested = matching::ingest_visible(&self.map, &self.sensor, &self.config);
        self.stats.visible_counts.push(ingested.len());
        if self.config.verbose > 0 {
            log::info!("visible map features: {}", ingested.len());
        }

        let mut matched =
            matching::match_against_map(self.engine.as_mut(), frame, &ingested, keyframe_id);
        self.stats.match_ratios.push(matched.inlier_ratio);
        self.stats.measurement_counts.push(matched.measurements.len());

        matching::admit_edges(
            &self.map,
            self.engine.as_mut(),
            frame,
            &step.increment,
            keyframe_id,
            &mut matched,
            &self.config,
        );

        if admission::should_add_features(
            ingested.len(),
            matched.measurements.len(),
            &self.config,
        ) {
            let candidates = admission::select_new_landmarks(
                self.engine.features(),
                &ingested.visible,
                &self.config,
            );
            let added = self.map.add_features(candidates, keyframe_id).len();
            if self.config.verbose > 0 {
                log::info!("admitted {added} landmarks");
            }
        }
    }

    /// Shutdown: stop the map manager, stop loop closure, run the deferred
    /// optimizer if configured, drain the concurrent one, then write the
    /// trajectory and log outputs.
    pub fn finalize(mut self) -> Result<RunStats, SlamError> {
        if let Some(elapsed) = self.started.map(|started| started.elapsed().as_secs_f64()) {
            if elapsed > 0.0 {
                self.stats.fps = self.stats.frames as f64 / elapsed;
            }
        }

        if let Some(worker) = self.map_manager.take() {
            worker.join();
        }
        if let Some(worker) = self.loop_closure.take() {
            worker.join();
        }
        if self.config.optimizer_mode == OptimizerMode::AtEnd && !self.config.only_vo {
            let report = optimize_once(&self.map, &self.config.optimizer, self.kernel());
            log::info!(
                "deferred optimization: {} sweeps, residual {:.3e} -> {:.3e}",
                report.sweeps,
                report.initial_residual,
                report.final_residual
            );
        }
        if let Some(worker) = self.optimizer.take() {
            worker.join();
        }

        self.stats.vo_failures = self.vo.failure_count;
        self.stats.gated_increments = self.vo.gated_count;
        self.stats.loop_closures_accepted = self
            .loop_closure_shared
            .accepted
            .load(std::sync::atomic::Ordering::Relaxed);
        self.stats.loop_closures_spurious = self
            .loop_closure_shared
            .spurious
            .load(std::sync::atomic::Ordering::Relaxed);

        self.write_outputs()?;

        log::info!(
            "finished: {} frames ({} faults), {} keyframes, {} landmarks, \
             {} VO failures, {} gated increments, {:.1} fps",
            self.stats.frames,
            self.stats.frame_faults,
            self.map.keyframe_count(),
            self.map.landmark_count(),
            self.stats.vo_failures,
            self.stats.gated_increments,
            self.stats.fps
        );
        Ok(self.stats)
    }

    fn write_outputs(&self) -> Result<(), SlamError> {
        std::fs::create_dir_all(&self.output_dir)?;

        let mut vo_file = std::fs::File::create(self.output_dir.join("VO_trajectory.res"))?;
        write_freiburg(&mut vo_file, &self.vo_trajectory)?;

        if !self.config.only_vo {
            let mut graph_file =
                std::fs::File::create(self.output_dir.join("graph_trajectory.res"))?;
            write_freiburg(&mut graph_file, &self.map.trajectory())?;
        }

        let mut fps_file = std::fs::File::create(self.output_dir.join("fps.res"))?;
        write!(fps_file, "{}", self.stats.fps)?;

        if self.config.loop_closure_mode.enabled() {
            let mut pairs_file =
                std::fs::File::create(self.output_dir.join("loop_pairs.res"))?;
            writeln!(pairs_file, "id1 id2 probability matching_ratio")?;
            for pair in self.loop_closure_shared.pairs_snapshot() {
                writeln!(
                    pairs_file,
                    "{} {} {} {}",
                    pair.first, pair.second, pair.probability, pair.matching_ratio
                )?;
            }
        }
        Ok(())
    }

    /// The shared map, for consumers of finished poses and frames.
    pub fn map(&self) -> &Arc<FeaturesMap> {
        &self.map
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }
}
