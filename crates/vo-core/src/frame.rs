//! Per-frame data containers shared between the orchestrator and trackers.

use image::RgbImage;
use nalgebra::{DMatrix, Point2};
use vo_geometry::{DepthMap, FlowField, Se3};

use crate::config::KpSource;

/// One frame's worth of pipeline state.
///
/// The orchestrator exclusively owns the current/reference pair; trackers
/// only ever see immutable views. Pair-scoped fields (`flow`, `flow_diff`,
/// keypoints, inliers) always refer to the pairing with the other buffer
/// and are cleared or overwritten on advance.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    pub id: i64,
    pub timestamp: i64,
    pub img: Option<RgbImage>,
    /// Depth as measured/loaded (e.g. ground-truth sensor depth).
    pub raw_depth: Option<DepthMap>,
    /// Depth used for scale recovery and keypoint validity (predicted, or
    /// mirrored from `raw_depth` when no prediction exists).
    pub depth: Option<DepthMap>,
    /// Dense displacement from this frame to the paired reference.
    pub flow: Option<FlowField>,
    /// Forward–backward flow error of `flow`.
    pub flow_diff: Option<DMatrix<f32>>,
    /// Residual between `flow` and the rigid flow of the latest pose.
    pub rigid_flow_diff: Option<DMatrix<f32>>,
    pub rigid_flow_mask: Option<DMatrix<bool>>,
    /// This frame's side of the matched best-scoring keypoints.
    pub kp_best: Option<Vec<Point2<f64>>>,
    /// This frame's side of the depth-valid keypoints.
    pub kp_depth: Option<Vec<Point2<f64>>>,
    /// Inlier mask of the last 2D-2D/3D-2D solve, aligned with the
    /// keypoint ordering of the pair.
    pub inliers: Option<Vec<bool>>,
    /// Relative pose of the pair after tracking; global pose once the
    /// frame has been integrated and advanced.
    pub pose: Option<Se3>,
    /// Last accepted relative pose, kept across advances for the
    /// constant-motion fallback.
    pub motion: Option<Se3>,
    /// Externally predicted relative pose for the pair, when supplied.
    pub deep_pose: Option<Se3>,
}

impl FrameBuffer {
    pub fn kp(&self, src: KpSource) -> Option<&Vec<Point2<f64>>> {
        match src {
            KpSource::KpBest => self.kp_best.as_ref(),
            KpSource::KpDepth => self.kp_depth.as_ref(),
        }
    }

    pub fn set_kp(&mut self, src: KpSource, kp: Vec<Point2<f64>>) {
        match src {
            KpSource::KpBest => self.kp_best = Some(kp),
            KpSource::KpDepth => self.kp_depth = Some(kp),
        }
    }

    /// Drop pair-scoped dense fields so they cannot leak across frames.
    pub fn clear_pair_data(&mut self) {
        self.flow = None;
        self.flow_diff = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_pair_state() {
        let frame = FrameBuffer::default();
        assert!(frame.flow.is_none());
        assert!(frame.flow_diff.is_none());
        assert!(frame.kp_best.is_none());
        assert!(frame.pose.is_none());
    }

    #[test]
    fn clear_pair_data_only_touches_flow_fields() {
        let mut frame = FrameBuffer {
            flow: Some(FlowField::zeros(4, 4)),
            flow_diff: Some(DMatrix::zeros(4, 4)),
            motion: Some(Se3::identity()),
            ..Default::default()
        };
        frame.clear_pair_data();
        assert!(frame.flow.is_none());
        assert!(frame.flow_diff.is_none());
        assert!(frame.motion.is_some());
    }

    #[test]
    fn kp_accessor_follows_source() {
        let mut frame = FrameBuffer::default();
        frame.set_kp(KpSource::KpBest, vec![Point2::new(1.0, 2.0)]);
        assert_eq!(frame.kp(KpSource::KpBest).map(Vec::len), Some(1));
        assert!(frame.kp(KpSource::KpDepth).is_none());
    }
}
