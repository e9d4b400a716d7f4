//! Depth-flow consistency check: compares the flow a rigid scene would
//! induce under a pose prior with the observed optical flow.

use nalgebra::DMatrix;
use vo_geometry::{ops, Intrinsics, Se3};

use crate::config::KpSelectionConfig;
use crate::frame::FrameBuffer;
use crate::{Error, Result};

/// Residual and mask produced by one consistency pass.
#[derive(Debug, Clone)]
pub struct ConsistencyMaps {
    pub rigid_flow_diff: DMatrix<f32>,
    pub rigid_flow_mask: DMatrix<bool>,
}

#[derive(Debug, Clone)]
pub struct DepthConsistency {
    cfg: KpSelectionConfig,
    intrinsics: Intrinsics,
}

impl DepthConsistency {
    pub fn new(cfg: KpSelectionConfig, intrinsics: Intrinsics) -> Self {
        Self { cfg, intrinsics }
    }

    /// Build the rigid-flow mask for the pair under the best available
    /// pose prior: the supplied deep pose, else the last motion, else
    /// identity. Pure in its inputs, so repeated invocations with the
    /// same pose agree.
    pub fn compute(&self, cur: &FrameBuffer, reference: &FrameBuffer) -> Result<ConsistencyMaps> {
        let prior = reference
            .deep_pose
            .clone()
            .or_else(|| reference.motion.clone())
            .unwrap_or_else(Se3::identity);
        self.compute_with_pose(cur, &prior)
    }

    /// Same check under an explicit current→reference pose.
    pub fn compute_with_pose(&self, cur: &FrameBuffer, pose: &Se3) -> Result<ConsistencyMaps> {
        let flow = cur.flow.as_ref().ok_or(Error::DataUnavailable("dense flow"))?;
        let depth = cur.depth.as_ref().ok_or(Error::DataUnavailable("current depth"))?;

        let (rigid, valid) = ops::rigid_flow(depth, &self.intrinsics, pose);
        let (height, width) = depth.shape();
        let mut diff = DMatrix::from_element(height, width, f32::INFINITY);
        let mut mask = DMatrix::from_element(height, width, false);
        for row in 0..height {
            for col in 0..width {
                if !valid[(row, col)] {
                    continue;
                }
                let du = rigid.u[(row, col)] - flow.u[(row, col)];
                let dv = rigid.v[(row, col)] - flow.v[(row, col)];
                let d = (du * du + dv * dv).sqrt();
                diff[(row, col)] = d;
                mask[(row, col)] = (d as f64) < self.cfg.depth_consistency.thre;
            }
        }
        Ok(ConsistencyMaps {
            rigid_flow_diff: diff,
            rigid_flow_mask: mask,
        })
    }
}
