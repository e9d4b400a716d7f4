//! Relative-pose trackers.

mod essential;
mod pnp;

pub use essential::{EssTracker, ScaleOutput};
pub use pnp::PnpTracker;

use vo_geometry::Se3;

/// Which estimator produced the frame's relative pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    EssentialMatrix,
    Pnp,
    DeepPose,
}

impl TrackingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingMode::EssentialMatrix => "essential_matrix",
            TrackingMode::Pnp => "PnP",
            TrackingMode::DeepPose => "deep_pose",
        }
    }
}

/// Pose (current→reference) and inlier mask aligned with the input
/// keypoint ordering.
#[derive(Debug, Clone)]
pub struct TrackerOutput {
    pub pose: Se3,
    pub inliers: Vec<bool>,
}
