//! PnP tracker: 3D-2D relative pose from reference depth, used when the
//! Essential path degenerates.

use nalgebra::Point2;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::debug;
use vo_geometry::{pnp, DepthMap, Intrinsics, Se3};

use crate::config::{Config, KpSelectionConfig, PnpTrackerConfig};
use crate::frame::FrameBuffer;
use crate::sampler::{select_good_depth_kp, GoodDepthSelection};
use crate::tracker::TrackerOutput;
use crate::Result;

const MIN_LIFTED: usize = 6;

pub struct PnpTracker {
    cfg: PnpTrackerConfig,
    kp_cfg: KpSelectionConfig,
    intrinsics: Intrinsics,
    rng: SmallRng,
}

impl PnpTracker {
    pub fn new(cfg: &Config, intrinsics: Intrinsics) -> Self {
        Self {
            cfg: cfg.pnp_tracker.clone(),
            kp_cfg: cfg.kp_selection.clone(),
            intrinsics,
            rng: SmallRng::seed_from_u64(cfg.seed ^ 0x706e_70),
        }
    }

    /// Relative pose (current→reference) from reference-frame depth and
    /// current-frame observations.
    ///
    /// Reference keypoints without a usable depth are dropped before the
    /// solve; `None` when too few survive or RANSAC finds no consensus,
    /// letting the orchestrator fall back to constant motion.
    /// `finalize = false` halves the RANSAC budget for the provisional
    /// solve preceding keypoint refinement.
    pub fn compute_pose_3d2d(
        &mut self,
        kp_ref: &[Point2<f64>],
        kp_cur: &[Point2<f64>],
        depth_ref: &DepthMap,
        finalize: bool,
    ) -> Option<TrackerOutput> {
        let n = kp_ref.len();
        if n != kp_cur.len() {
            return None;
        }
        let (height, width) = depth_ref.shape();
        let mut points3 = Vec::new();
        let mut pixels = Vec::new();
        let mut kept = Vec::new();
        for (i, (r, c)) in kp_ref.iter().zip(kp_cur.iter()).enumerate() {
            let col = r.x.round();
            let row = r.y.round();
            if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
                continue;
            }
            let d = depth_ref[(row as usize, col as usize)] as f64;
            if d <= 0.0 {
                continue;
            }
            points3.push(self.intrinsics.unproject_pixel(r, d));
            pixels.push(*c);
            kept.push(i);
        }
        if points3.len() < MIN_LIFTED {
            debug!(lifted = points3.len(), "pnp tracker: not enough depth-backed keypoints");
            return None;
        }

        let budget = if finalize {
            self.cfg.ransac.iter.max(1)
        } else {
            (self.cfg.ransac.iter / 2).max(1)
        };
        let solved = pnp::solve_pnp(
            &points3,
            &pixels,
            &self.intrinsics,
            self.cfg.ransac.reproj_thre,
            budget,
            &mut self.rng,
        );
        let (r, t, mask) = match solved {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "pnp solve failed");
                return None;
            }
        };
        // The solver pose maps reference→current; the pipeline convention
        // is current→reference.
        let pose = match Se3::from_decomposition(r, t) {
            Ok(p) => p.inv(),
            Err(e) => {
                debug!(error = %e, "pnp rotation rejected");
                return None;
            }
        };

        let mut inliers = vec![false; n];
        for (j, &i) in kept.iter().enumerate() {
            inliers[i] = mask[j];
        }
        Some(TrackerOutput { pose, inliers })
    }

    /// Re-select keypoints consistent with the rigid flow of `pose`.
    pub fn compute_rigid_flow_kp(
        &self,
        cur: &FrameBuffer,
        reference: &FrameBuffer,
        pose: &Se3,
    ) -> Result<GoodDepthSelection> {
        select_good_depth_kp(cur, reference, pose, &self.intrinsics, &self.kp_cfg)
    }
}
