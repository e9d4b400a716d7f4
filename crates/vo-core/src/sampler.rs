//! Keypoint sampling from dense optical flow and validity masks.

use nalgebra::{DMatrix, Point2};
use tracing::debug;
use vo_geometry::{ops, DepthMap, FlowField, Intrinsics, Se3};

use crate::config::KpSelectionConfig;
use crate::frame::FrameBuffer;
use crate::{Error, Result};

/// Matched keypoint sets selected for one frame pair.
#[derive(Debug, Clone)]
pub struct KpSelection {
    pub kp_cur_best: Vec<Point2<f64>>,
    pub kp_ref_best: Vec<Point2<f64>>,
    pub kp_cur_depth: Option<Vec<Point2<f64>>>,
    pub kp_ref_depth: Option<Vec<Point2<f64>>>,
    pub good_kp_found: bool,
}

/// Depth-consistent keypoints re-selected under a provisional pose.
#[derive(Debug, Clone)]
pub struct GoodDepthSelection {
    pub kp_cur: Vec<Point2<f64>>,
    pub kp_ref: Vec<Point2<f64>>,
    pub rigid_flow_diff: DMatrix<f32>,
    pub rigid_flow_mask: DMatrix<bool>,
}

#[derive(Debug, Clone)]
pub struct KeypointSampler {
    cfg: KpSelectionConfig,
}

impl KeypointSampler {
    pub fn new(cfg: KpSelectionConfig) -> Self {
        Self { cfg }
    }

    /// Select `kp_best` (and, when enabled, `kp_depth`) for the pair.
    ///
    /// Candidates must land inside the reference image, pass the
    /// forward–backward flow check and, when depth consistency ran, the
    /// rigid-flow mask; ranking is ascending forward–backward error.
    pub fn kp_selection(&self, cur: &FrameBuffer, reference: &FrameBuffer) -> Result<KpSelection> {
        let flow = cur.flow.as_ref().ok_or(Error::DataUnavailable("dense flow"))?;
        let extra_mask = if self.cfg.depth_consistency.enable {
            cur.rigid_flow_mask.as_ref()
        } else {
            None
        };

        let (kp_cur_best, kp_ref_best) = rank_candidates(
            flow,
            cur.flow_diff.as_ref(),
            extra_mask,
            None,
            self.cfg.flow_consistency.thre,
            self.cfg.num_kp,
        );

        let (kp_cur_depth, kp_ref_depth) = if self.cfg.good_depth_kp.enable {
            match (cur.depth.as_ref(), reference.depth.as_ref()) {
                (Some(cur_depth), Some(ref_depth)) => {
                    let (c, r) = rank_candidates(
                        flow,
                        cur.flow_diff.as_ref(),
                        extra_mask,
                        Some((cur_depth, ref_depth)),
                        self.cfg.flow_consistency.thre,
                        self.cfg.num_kp,
                    );
                    (Some(c), Some(r))
                }
                _ => (None, None),
            }
        } else {
            (None, None)
        };

        let good_kp_found = kp_cur_best.len() >= self.cfg.min_kp;
        if !good_kp_found {
            debug!(
                survivors = kp_cur_best.len(),
                min_kp = self.cfg.min_kp,
                "keypoint selection below minimum"
            );
        }
        Ok(KpSelection {
            kp_cur_best,
            kp_ref_best,
            kp_cur_depth,
            kp_ref_depth,
            good_kp_found,
        })
    }

    /// Write a successful selection into both sides of the pair.
    pub fn update_kp_data(
        &self,
        cur: &mut FrameBuffer,
        reference: &mut FrameBuffer,
        sel: KpSelection,
    ) {
        cur.kp_best = Some(sel.kp_cur_best);
        reference.kp_best = Some(sel.kp_ref_best);
        if let (Some(c), Some(r)) = (sel.kp_cur_depth, sel.kp_ref_depth) {
            cur.kp_depth = Some(c);
            reference.kp_depth = Some(r);
        }
    }
}

/// Re-select depth-valid keypoints that agree with the rigid flow a
/// provisional current→reference pose induces.
pub fn select_good_depth_kp(
    cur: &FrameBuffer,
    reference: &FrameBuffer,
    pose: &Se3,
    k: &Intrinsics,
    cfg: &KpSelectionConfig,
) -> Result<GoodDepthSelection> {
    let flow = cur.flow.as_ref().ok_or(Error::DataUnavailable("dense flow"))?;
    let cur_depth = cur.depth.as_ref().ok_or(Error::DataUnavailable("current depth"))?;
    let ref_depth = reference
        .depth
        .as_ref()
        .ok_or(Error::DataUnavailable("reference depth"))?;

    let (rigid, rigid_valid) = ops::rigid_flow(cur_depth, k, pose);
    let (height, width) = cur_depth.shape();
    let mut diff = DMatrix::from_element(height, width, f32::INFINITY);
    let mut mask = DMatrix::from_element(height, width, false);
    for row in 0..height {
        for col in 0..width {
            if !rigid_valid[(row, col)] {
                continue;
            }
            let du = rigid.u[(row, col)] - flow.u[(row, col)];
            let dv = rigid.v[(row, col)] - flow.v[(row, col)];
            let d = (du * du + dv * dv).sqrt();
            diff[(row, col)] = d;
            mask[(row, col)] = (d as f64) < cfg.depth_consistency.thre;
        }
    }

    let (kp_cur, kp_ref) = rank_candidates(
        flow,
        cur.flow_diff.as_ref(),
        Some(&mask),
        Some((cur_depth, ref_depth)),
        cfg.flow_consistency.thre,
        cfg.num_kp,
    );
    Ok(GoodDepthSelection {
        kp_cur,
        kp_ref,
        rigid_flow_diff: diff,
        rigid_flow_mask: mask,
    })
}

/// Candidate pixels under the combined mask, ranked by ascending
/// forward–backward error, truncated to `num_kp` matched pairs.
fn rank_candidates(
    flow: &FlowField,
    flow_diff: Option<&DMatrix<f32>>,
    extra_mask: Option<&DMatrix<bool>>,
    depth_pair: Option<(&DepthMap, &DepthMap)>,
    flow_thre: f64,
    num_kp: usize,
) -> (Vec<Point2<f64>>, Vec<Point2<f64>>) {
    let height = flow.height();
    let width = flow.width();
    let mut candidates: Vec<(f32, usize)> = Vec::new();
    for row in 0..height {
        for col in 0..width {
            let (x, y) = flow.endpoint(row, col);
            if x < 0.0 || y < 0.0 || x > (width - 1) as f64 || y > (height - 1) as f64 {
                continue;
            }
            let diff = flow_diff.map_or(0.0, |d| d[(row, col)]);
            if (diff as f64) >= flow_thre {
                continue;
            }
            if let Some(mask) = extra_mask {
                if !mask[(row, col)] {
                    continue;
                }
            }
            if let Some((cur_depth, ref_depth)) = depth_pair {
                if cur_depth[(row, col)] <= 0.0 {
                    continue;
                }
                let (rr, rc) = (y.round() as usize, x.round() as usize);
                if ref_depth[(rr, rc)] <= 0.0 {
                    continue;
                }
            }
            candidates.push((diff, row * width + col));
        }
    }
    candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    candidates.truncate(num_kp);

    let mut kp_cur = Vec::with_capacity(candidates.len());
    let mut kp_ref = Vec::with_capacity(candidates.len());
    for (_, idx) in candidates {
        let row = idx / width;
        let col = idx % width;
        let (x, y) = flow.endpoint(row, col);
        kp_cur.push(Point2::new(col as f64, row as f64));
        kp_ref.push(Point2::new(x, y));
    }
    (kp_cur, kp_ref)
}
