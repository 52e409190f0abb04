use std::collections::HashMap;

use nalgebra::{Vector3, Vector6};

use crate::{
    map::{FeatureEdge, FeaturesMap, PoseEdge},
    transform::Transform,
};

use super::{GaussNewton, RobustKernel};

/// Outcome of one optimization run.
#[derive(Clone, Copy, Debug, Default)]
pub struct OptimizeReport {
    pub sweeps: usize,
    pub converged: bool,
    /// The last sweep grew the residual and was discarded.
    pub diverged: bool,
    pub initial_residual: f64,
    pub final_residual: f64,
}

/// Pose-graph / bundle-adjustment problem over a snapshot of the map.
///
/// The graph alternates Gauss-Seidel style: every non-anchor pose solves a
/// local Gauss-Newton system over its pose-landmark and pose-pose residuals
/// and applies an se(3) update, then every landmark re-solves its position
/// from its observations. The keyframe with the smallest id is anchored.
pub struct PoseGraph {
    poses: Vec<(u32, Transform)>,
    landmarks: Vec<(u32, Vector3<f64>)>,
    pose_index: HashMap<u32, usize>,
    landmark_index: HashMap<u32, usize>,
    pose_edges: Vec<PoseEdge>,
    feature_edges: Vec<FeatureEdge>,
    edges_of_pose: HashMap<u32, Vec<usize>>,
    edges_of_landmark: HashMap<u32, Vec<usize>>,
    kernel: RobustKernel,
    anchor: Option<u32>,
}

impl PoseGraph {
    /// Snapshots poses, landmark positions and constraints from the map in
    /// one consistent read.
    pub fn from_map(map: &FeaturesMap, kernel: RobustKernel) -> Self {
        map.with_state(|state| {
            let poses: Vec<(u32, Transform)> = state
                .keyframes
                .iter()
                .map(|keyframe| (keyframe.id, keyframe.world_from_cam.clone()))
                .collect();
            let landmarks: Vec<(u32, Vector3<f64>)> = state
                .landmarks
                .iter()
                .flatten()
                .map(|landmark| (landmark.id, landmark.position))
                .collect();
            Self::new(
                poses,
                landmarks,
                state.pose_edges.clone(),
                state.feature_edges.clone(),
                kernel,
            )
        })
    }

    pub fn new(
        poses: Vec<(u32, Transform)>,
        landmarks: Vec<(u32, Vector3<f64>)>,
        pose_edges: Vec<PoseEdge>,
        feature_edges: Vec<FeatureEdge>,
        kernel: RobustKernel,
    ) -> Self {
        let pose_index: HashMap<u32, usize> = poses
            .iter()
            .enumerate()
            .map(|(index, &(id, _))| (id, index))
            .collect();
        let landmark_index: HashMap<u32, usize> = landmarks
            .iter()
            .enumerate()
            .map(|(index, &(id, _))| (id, index))
            .collect();

        // Constraints referencing entities outside the snapshot are ignored.
        let feature_edges: Vec<FeatureEdge> = feature_edges
            .into_iter()
            .filter(|edge| {
                pose_index.contains_key(&edge.keyframe)
                    && landmark_index.contains_key(&edge.landmark)
            })
            .collect();
        let pose_edges: Vec<PoseEdge> = pose_edges
            .into_iter()
            .filter(|edge| {
                pose_index.contains_key(&edge.from) && pose_index.contains_key(&edge.to)
            })
            .collect();

        let mut edges_of_pose: HashMap<u32, Vec<usize>> = HashMap::new();
        let mut edges_of_landmark: HashMap<u32, Vec<usize>> = HashMap::new();
        for (index, edge) in feature_edges.iter().enumerate() {
            edges_of_pose.entry(edge.keyframe).or_default().push(index);
            edges_of_landmark
                .entry(edge.landmark)
                .or_default()
                .push(index);
        }

        let anchor = poses.iter().map(|&(id, _)| id).min();

        Self {
            poses,
            landmarks,
            pose_index,
            landmark_index,
            pose_edges,
            feature_edges,
            edges_of_pose,
            edges_of_landmark,
            kernel,
            anchor,
        }
    }

    pub fn poses(&self) -> &[(u32, Transform)] {
        &self.poses
    }

    pub fn landmarks(&self) -> &[(u32, Vector3<f64>)] {
        &self.landmarks
    }

    pub fn is_empty(&self) -> bool {
        self.pose_edges.is_empty() && self.feature_edges.is_empty()
    }

    /// Total objective over all constraints, under the robust kernel.
    pub fn total_residual(&self) -> f64 {
        let mut total = 0.0;
        for edge in &self.feature_edges {
            let pose = &self.poses[self.pose_index[&edge.keyframe]].1;
            let position = self.landmarks[self.landmark_index[&edge.landmark]].1;
            let local = pose.inverse().transform_point(&position);
            total += self
                .kernel
                .cost((local - edge.local_position).norm_squared());
        }
        for edge in &self.pose_edges {
            let from = &self.poses[self.pose_index[&edge.from]].1;
            let to = &self.poses[self.pose_index[&edge.to]].1;
            let predicted = from * &edge.increment;
            total += self.kernel.cost(predicted.error_to(to).norm_squared());
        }
        total
    }

    fn sweep_pose(&mut self, index: usize) {
        let (id, _) = self.poses[index];
        let mut gn = GaussNewton::<6>::new();

        let pose = self.poses[index].1.clone();
        let cam_from_world = pose.inverse();

        if let Some(edge_indices) = self.edges_of_pose.get(&id) {
            for &edge_index in edge_indices {
                let edge = &self.feature_edges[edge_index];
                let position = self.landmarks[self.landmark_index[&edge.landmark]].1;
                let local = cam_from_world.transform_point(&position);
                let residual = local - edge.local_position;
                let weight = self.kernel.weight(residual.norm_squared());

                // Right-perturbation jacobian of the local point:
                // d(local)/d(translation) = -I, d(local)/d(rotation) = [local]x.
                let skew = local.cross_matrix();
                for k in 0..3 {
                    let mut row = [0.0; 6];
                    row[k] = -1.0;
                    row[3] = skew[(k, 0)];
                    row[4] = skew[(k, 1)];
                    row[5] = skew[(k, 2)];
                    gn.step_weighted(weight, residual[k], &row);
                }
            }
        }

        for edge in &self.pose_edges {
            let predicted = if edge.to == id {
                let from = &self.poses[self.pose_index[&edge.from]].1;
                from * &edge.increment
            } else if edge.from == id {
                let to = &self.poses[self.pose_index[&edge.to]].1;
                to * &edge.increment.inverse()
            } else {
                continue;
            };

            let error: Vector6<f64> = predicted.error_to(&pose);
            let weight = self.kernel.weight(error.norm_squared());
            for k in 0..6 {
                let mut row = [0.0; 6];
                row[k] = 1.0;
                gn.step_weighted(weight, error[k], &row);
            }
        }

        if let Some(update) = gn.solve() {
            self.poses[index].1 = &pose * &Transform::exp(&(-update));
        }
    }

    fn sweep_landmark(&mut self, index: usize) {
        let (id, position) = self.landmarks[index];
        let mut gn = GaussNewton::<3>::new();

        if let Some(edge_indices) = self.edges_of_landmark.get(&id) {
            for &edge_index in edge_indices {
                let edge = &self.feature_edges[edge_index];
                let pose = &self.poses[self.pose_index[&edge.keyframe]].1;
                let observed = pose.transform_point(&edge.local_position);
                let residual = position - observed;
                let weight = self.kernel.weight(residual.norm_squared());
                for k in 0..3 {
                    let mut row = [0.0; 3];
                    row[k] = 1.0;
                    gn.step_weighted(weight, residual[k], &row);
                }
            }
        }

        if let Some(update) = gn.solve() {
            self.landmarks[index].1 = position - Vector3::new(update[0], update[1], update[2]);
        }
    }

    /// One Gauss-Seidel sweep over all poses, then all landmarks.
    pub fn sweep(&mut self) {
        for index in 0..self.poses.len() {
            if Some(self.poses[index].0) == self.anchor {
                continue;
            }
            self.sweep_pose(index);
        }
        for index in 0..self.landmarks.len() {
            self.sweep_landmark(index);
        }
    }

    /// Runs bounded sweeps until the residual change over one sweep drops
    /// under `eps`. A sweep that grows the residual is discarded and ends
    /// the run. `on_flush` fires every `flush_every` completed sweeps and
    /// once at the end; it is the publication hook.
    pub fn optimize(
        &mut self,
        max_sweeps: usize,
        eps: f64,
        flush_every: usize,
        mut on_flush: impl FnMut(&PoseGraph),
    ) -> OptimizeReport {
        let mut report = OptimizeReport {
            initial_residual: self.total_residual(),
            ..Default::default()
        };
        let mut previous = report.initial_residual;

        for sweep_count in 1..=max_sweeps {
            let backup = (self.poses.clone(), self.landmarks.clone());
            self.sweep();
            let current = self.total_residual();

            if current > previous + eps {
                self.poses = backup.0;
                self.landmarks = backup.1;
                report.diverged = true;
                break;
            }

            report.sweeps = sweep_count;
            let improvement = previous - current;
            previous = current;

            if sweep_count % flush_every == 0 {
                on_flush(self);
            }
            if improvement < eps {
                report.converged = true;
                break;
            }
        }

        report.final_residual = previous;
        on_flush(self);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::UnitQuaternion;

    fn translation(x: f64, y: f64, z: f64) -> Transform {
        Transform::from_parts(Vector3::new(x, y, z), UnitQuaternion::identity())
    }

    #[test]
    fn test_pose_edge_pulls_pose_onto_prediction() {
        let mut graph = PoseGraph::new(
            vec![(0, Transform::eye()), (1, translation(0.0, 0.0, 0.2))],
            Vec::new(),
            vec![PoseEdge {
                from: 0,
                to: 1,
                increment: translation(0.0, 0.0, 0.1),
            }],
            Vec::new(),
            RobustKernel::None,
        );

        let report = graph.optimize(50, 1e-12, 10, |_| {});
        assert!(report.converged);
        assert!(!report.diverged);
        assert!(report.final_residual < 1e-15);
        let refined = &graph.poses()[1].1;
        assert!((refined.translation() - Vector3::new(0.0, 0.0, 0.1)).norm() < 1e-9);
    }

    #[test]
    fn test_landmark_moves_to_observation_consensus() {
        let mut graph = PoseGraph::new(
            vec![(0, Transform::eye())],
            vec![(0, Vector3::new(0.0, 0.0, 2.5))],
            Vec::new(),
            vec![FeatureEdge {
                keyframe: 0,
                landmark: 0,
                local_position: Vector3::new(0.0, 0.0, 2.0),
            }],
            RobustKernel::None,
        );

        let report = graph.optimize(10, 1e-12, 10, |_| {});
        assert!(report.converged);
        assert!((graph.landmarks()[0].1 - Vector3::new(0.0, 0.0, 2.0)).norm() < 1e-9);
    }

    #[test]
    fn test_feature_edges_correct_a_biased_pose() {
        // Landmarks are exact; keyframe 1 starts 1 cm off its true pose
        // (0, 0, 0.05). Its exact local observations must pull it back.
        let true_pose = translation(0.0, 0.0, 0.05);
        let landmarks: Vec<(u32, Vector3<f64>)> = (0..6)
            .map(|i| {
                let angle = i as f64;
                (
                    i,
                    Vector3::new(angle.cos(), angle.sin(), 2.0 + 0.2 * angle),
                )
            })
            .collect();
        let feature_edges: Vec<FeatureEdge> = landmarks
            .iter()
            .map(|&(id, position)| FeatureEdge {
                keyframe: 1,
                landmark: id,
                local_position: true_pose.inverse().transform_point(&position),
            })
            .collect();

        let mut graph = PoseGraph::new(
            vec![(0, Transform::eye()), (1, translation(0.0, 0.0, 0.06))],
            landmarks,
            Vec::new(),
            feature_edges,
            RobustKernel::None,
        );

        let report = graph.optimize(50, 1e-14, 50, |_| {});
        assert!(report.final_residual < 1e-12);
        let refined = &graph.poses()[1].1;
        assert!(refined.error_to(&true_pose).norm() < 1e-6);
    }

    #[test]
    fn test_loop_edge_spreads_chain_drift() {
        // A 10-link chain whose odometry is biased 1 mm per link in z, plus
        // one exact loop edge between the ends. The optimum leaves the last
        // pose within about one link bias of the truth.
        const LINKS: usize = 10;
        const BIAS: f64 = 0.001;

        let mut poses = vec![(0, Transform::eye())];
        let mut pose_edges = Vec::new();
        let mut estimate = Transform::eye();
        for link in 1..=LINKS {
            let odometry = translation(0.1, 0.0, BIAS);
            estimate = &estimate * &odometry;
            poses.push((link as u32, estimate.clone()));
            pose_edges.push(PoseEdge {
                from: link as u32 - 1,
                to: link as u32,
                increment: odometry,
            });
        }
        // The true relative motion accumulates no z drift.
        pose_edges.push(PoseEdge {
            from: 0,
            to: LINKS as u32,
            increment: translation(0.1 * LINKS as f64, 0.0, 0.0),
        });

        let drift_before = poses[LINKS].1.translation()[2];
        assert!((drift_before - LINKS as f64 * BIAS).abs() < 1e-12);

        let mut graph =
            PoseGraph::new(poses, Vec::new(), pose_edges, Vec::new(), RobustKernel::None);
        let report = graph.optimize(500, 1e-14, 100, |_| {});
        assert!(!report.diverged);

        let drift_after = graph.poses()[LINKS].1.translation()[2];
        assert!(drift_after.abs() < 2.0 * BIAS);
        assert!(drift_after.abs() < drift_before.abs() / 4.0);
    }

    #[test]
    fn test_robust_kernel_resists_an_outlier_edge() {
        // Nine consistent observations of the landmark and one gross
        // outlier. With the Cauchy kernel the consensus wins.
        let mut feature_edges: Vec<FeatureEdge> = (0..9)
            .map(|_| FeatureEdge {
                keyframe: 0,
                landmark: 0,
                local_position: Vector3::new(0.0, 0.0, 2.0),
            })
            .collect();
        feature_edges.push(FeatureEdge {
            keyframe: 0,
            landmark: 0,
            local_position: Vector3::new(0.0, 0.0, 12.0),
        });

        let mut graph = PoseGraph::new(
            vec![(0, Transform::eye())],
            vec![(0, Vector3::new(0.0, 0.0, 2.2))],
            Vec::new(),
            feature_edges,
            RobustKernel::Cauchy(0.1),
        );
        graph.optimize(100, 1e-14, 100, |_| {});
        let refined = graph.landmarks()[0].1;
        assert!((refined - Vector3::new(0.0, 0.0, 2.0)).norm() < 0.05);
    }

    #[test]
    fn test_snapshot_ids_are_preserved() {
        let mut graph = PoseGraph::new(
            vec![(0, Transform::eye()), (1, translation(0.1, 0.0, 0.0))],
            vec![(5, Vector3::new(0.0, 0.0, 2.0))],
            vec![PoseEdge {
                from: 0,
                to: 1,
                increment: translation(0.1, 0.0, 0.0),
            }],
            vec![FeatureEdge {
                keyframe: 1,
                landmark: 5,
                local_position: Vector3::new(-0.1, 0.0, 2.0),
            }],
            RobustKernel::None,
        );
        graph.optimize(20, 1e-12, 10, |_| {});
        assert_eq!(graph.poses()[0].0, 0);
        assert_eq!(graph.poses()[1].0, 1);
        assert_eq!(graph.landmarks()[0].0, 5);
    }
}
