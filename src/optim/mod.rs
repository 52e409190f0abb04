mod gauss_newton;
mod pose_graph;
mod robust;

pub use gauss_newton::GaussNewton;
pub use pose_graph::{OptimizeReport, PoseGraph};
pub use robust::RobustKernel;
