//! Essential-matrix tracker: 2D-2D relative pose with repeated RANSAC and
//! majority validation, plus translation-scale recovery against predicted
//! depth.

use nalgebra::{Matrix3, Point2};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, warn};
use vo_geometry::{epipolar, homography, triangulation, DepthMap, Intrinsics, Se3};

use crate::config::{
    Config, KpSelectionConfig, KpSource, Pose2d2dConfig, RegressionMethod, ScaleMethod,
    ScaleRecoveryConfig, ValidityMethod,
};
use crate::frame::FrameBuffer;
use crate::regression::RansacRegressor;
use crate::sampler::{select_good_depth_kp, GoodDepthSelection};
use crate::tracker::TrackerOutput;
use crate::Result;

const RANSAC_PROB: f64 = 0.99;
const HOMOGRAPHY_REPROJ_THRE: f64 = 0.2;
/// Cheirality floor for per-iteration validity and the best-model check.
const CHEIRALITY_VALID_RATIO: f64 = 0.05;
/// Cheirality floor for accepting the recovered pose.
const CHEIRALITY_ACCEPT_RATIO: f64 = 0.1;
/// Scale recovery needs strictly more surviving pixels than this.
const MIN_SCALE_PIXELS: usize = 10;
const SCALE_CONVERGENCE_DELTA: f64 = 1e-3;
const SCALE_MAX_ROUNDS: usize = 5;

/// Scale-recovery result; refreshed keypoints/masks (iterative mode) are
/// handed back for the orchestrator to write into the frame buffers.
#[derive(Debug, Clone)]
pub struct ScaleOutput {
    pub scale: Option<f64>,
    pub refresh: Option<GoodDepthSelection>,
}

/// One repeated-RANSAC iteration outcome, in permuted keypoint order.
struct IterationRecord {
    e: Option<Matrix3<f64>>,
    valid: bool,
    record_ok: bool,
    inlier_cnt: usize,
    inliers: Vec<bool>,
}

/// Message handed to one RANSAC worker; workers share nothing mutable.
struct IterationInput<'a> {
    kp_cur: Vec<Point2<f64>>,
    kp_ref: Vec<Point2<f64>>,
    h_inlier_count: usize,
    total: usize,
    cfg: &'a Pose2d2dConfig,
    intrinsics: &'a Intrinsics,
    seed: u64,
}

pub struct EssTracker {
    cfg: Pose2d2dConfig,
    scale_cfg: ScaleRecoveryConfig,
    kp_cfg: KpSelectionConfig,
    intrinsics: Intrinsics,
    use_pool: bool,
    prev_scale: f64,
    rng: SmallRng,
}

impl EssTracker {
    pub fn new(cfg: &Config, intrinsics: Intrinsics) -> Self {
        Self {
            cfg: cfg.compute_2d2d_pose.clone(),
            scale_cfg: cfg.scale_recovery.clone(),
            kp_cfg: cfg.kp_selection.clone(),
            intrinsics,
            use_pool: cfg.use_multiprocessing,
            prev_scale: 1.0,
            rng: SmallRng::seed_from_u64(cfg.seed),
        }
    }

    /// Last accepted translation scale.
    pub fn prev_scale(&self) -> f64 {
        self.prev_scale
    }

    /// Relative pose from the current to the reference view.
    ///
    /// `finalize = false` marks a provisional solve that a keypoint
    /// refinement pass will overwrite; it runs a single validated RANSAC
    /// round instead of the full repeated vote.
    pub fn compute_pose_2d2d(
        &mut self,
        kp_ref: &[Point2<f64>],
        kp_cur: &[Point2<f64>],
        finalize: bool,
    ) -> TrackerOutput {
        self.compute_impl(kp_ref, kp_cur, finalize, false)
    }

    /// Worker-pool variant; iterations run in parallel and aggregate
    /// identically to the serial path.
    pub fn compute_pose_2d2d_mp(
        &mut self,
        kp_ref: &[Point2<f64>],
        kp_cur: &[Point2<f64>],
        finalize: bool,
    ) -> TrackerOutput {
        self.compute_impl(kp_ref, kp_cur, finalize, true)
    }

    /// Dispatch on the configured execution mode.
    pub fn compute_pose(
        &mut self,
        kp_ref: &[Point2<f64>],
        kp_cur: &[Point2<f64>],
        finalize: bool,
    ) -> TrackerOutput {
        if self.use_pool {
            self.compute_pose_2d2d_mp(kp_ref, kp_cur, finalize)
        } else {
            self.compute_pose_2d2d(kp_ref, kp_cur, finalize)
        }
    }

    fn compute_impl(
        &mut self,
        kp_ref: &[Point2<f64>],
        kp_cur: &[Point2<f64>],
        finalize: bool,
        parallel: bool,
    ) -> TrackerOutput {
        let n = kp_cur.len();
        let identity = TrackerOutput {
            pose: Se3::identity(),
            inliers: vec![true; n],
        };
        if n < 8 || kp_ref.len() != n {
            debug!(count = n, "essential tracker skipped: not enough keypoints");
            return identity;
        }

        // Validity pre-check.
        let mut h_inlier_count = 0;
        match self.cfg.validity.method {
            ValidityMethod::Flow => {
                let avg: f64 = kp_ref
                    .iter()
                    .zip(kp_cur.iter())
                    .map(|(r, c)| (r - c).norm())
                    .sum::<f64>()
                    / n as f64;
                if avg <= self.cfg.validity.thre {
                    debug!(avg_flow = avg, "baseline too small for the essential solve");
                    return identity;
                }
            }
            ValidityMethod::HomoRatio => {
                match homography::find_homography(
                    kp_cur,
                    kp_ref,
                    HOMOGRAPHY_REPROJ_THRE,
                    RANSAC_PROB,
                    &mut self.rng,
                ) {
                    Ok(mask) => h_inlier_count = mask.iter().filter(|&&m| m).count(),
                    Err(e) => debug!(error = %e, "homography pre-fit failed"),
                }
            }
        }

        let repeat = if finalize {
            self.cfg.ransac.repeat.max(1)
        } else {
            1
        };
        // Permutations and worker seeds are drawn serially so serial and
        // pooled runs agree for a given tracker seed.
        let perms: Vec<Vec<usize>> = (0..repeat)
            .map(|_| {
                let mut idx: Vec<usize> = (0..n).collect();
                idx.shuffle(&mut self.rng);
                idx
            })
            .collect();
        let seeds: Vec<u64> = (0..repeat).map(|_| self.rng.gen()).collect();

        let make_input = |perm: &Vec<usize>, seed: u64| IterationInput {
            kp_cur: perm.iter().map(|&i| kp_cur[i]).collect(),
            kp_ref: perm.iter().map(|&i| kp_ref[i]).collect(),
            h_inlier_count,
            total: n,
            cfg: &self.cfg,
            intrinsics: &self.intrinsics,
            seed,
        };
        let records: Vec<IterationRecord> = if parallel {
            perms
                .par_iter()
                .zip(seeds.par_iter())
                .map(|(perm, &seed)| find_essential_once(make_input(perm, seed)))
                .collect()
        } else {
            perms
                .iter()
                .zip(seeds.iter())
                .map(|(perm, &seed)| find_essential_once(make_input(perm, seed)))
                .collect()
        };

        // Aggregate: count validated iterations, keep the strongest model
        // with its inlier mask mapped back to the input ordering.
        let mut num_valid = 0usize;
        let mut best: Option<(Matrix3<f64>, usize, Vec<bool>)> = None;
        for (record, perm) in records.iter().zip(perms.iter()) {
            if record.valid {
                num_valid += 1;
            }
            let Some(e) = record.e else { continue };
            if record.record_ok && record.inlier_cnt > best.as_ref().map_or(0, |b| b.1) {
                let mut depermuted = vec![false; n];
                for (j, &orig) in perm.iter().enumerate() {
                    depermuted[orig] = record.inliers[j];
                }
                best = Some((e, record.inlier_cnt, depermuted));
            }
        }

        let mut pose = Se3::identity();
        let mut inliers = identity.inliers;
        if let Some((e, _, mask)) = best {
            inliers = mask;
            if num_valid as f64 > repeat as f64 / 2.0 {
                match epipolar::recover_pose(&e, kp_cur, kp_ref, &self.intrinsics) {
                    Ok((r, t, cheirality))
                        if cheirality as f64 > n as f64 * CHEIRALITY_ACCEPT_RATIO =>
                    {
                        match Se3::from_decomposition(r, t) {
                            Ok(p) => pose = p,
                            Err(e) => warn!(error = %e, "recovered rotation rejected"),
                        }
                    }
                    Ok((_, _, cheirality)) => {
                        debug!(cheirality, "recovered pose failed the cheirality floor")
                    }
                    Err(e) => debug!(error = %e, "pose recovery failed"),
                }
            } else {
                debug!(num_valid, repeat, "majority vote failed");
            }
        }
        TrackerOutput { pose, inliers }
    }

    /// Recover the metric scale of `e_pose.t` against predicted depth.
    pub fn scale_recovery(
        &mut self,
        cur: &FrameBuffer,
        reference: &FrameBuffer,
        e_pose: &Se3,
    ) -> ScaleOutput {
        let out = match self.scale_cfg.method {
            ScaleMethod::Single => ScaleOutput {
                scale: self.scale_recovery_single(cur, reference, e_pose),
                refresh: None,
            },
            ScaleMethod::Iterative => self.scale_recovery_iterative(cur, reference, e_pose),
        };
        // Only accepted positive scales persist for the next frame.
        if let Some(s) = out.scale {
            self.prev_scale = s;
        }
        out
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

    fn scale_recovery_single(
        &mut self,
        cur: &FrameBuffer,
        reference: &FrameBuffer,
        e_pose: &Se3,
    ) -> Option<f64> {
        let depth = cur.depth.as_ref()?;
        let src = self.scale_cfg.kp_src;
        let kp_ref = reference.kp(src)?.clone();
        let kp_cur = cur.kp(src)?.clone();
        self.find_scale_from_depth(&kp_ref, &kp_cur, &e_pose.inv(), depth)
    }

    fn scale_recovery_iterative(
        &mut self,
        cur: &FrameBuffer,
        reference: &FrameBuffer,
        e_pose: &Se3,
    ) -> ScaleOutput {
        let Some(depth) = cur.depth.as_ref() else {
            return ScaleOutput {
                scale: None,
                refresh: None,
            };
        };
        let mut scale = self.prev_scale;
        let mut refresh: Option<GoodDepthSelection> = None;
        for _ in 0..SCALE_MAX_ROUNDS {
            let mut provisional = e_pose.clone();
            provisional.t *= scale;
            let sel = match select_good_depth_kp(
                cur,
                reference,
                &provisional,
                &self.intrinsics,
                &self.kp_cfg,
            ) {
                Ok(sel) => sel,
                Err(e) => {
                    debug!(error = %e, "iterative scale: keypoint refresh failed");
                    return ScaleOutput {
                        scale: None,
                        refresh,
                    };
                }
            };
            let (kp_ref, kp_cur_sel) = match self.scale_cfg.kp_src {
                KpSource::KpDepth => (sel.kp_ref.clone(), sel.kp_cur.clone()),
                KpSource::KpBest => match inlier_filtered_best(cur, reference) {
                    Some(pair) => pair,
                    None => (sel.kp_ref.clone(), sel.kp_cur.clone()),
                },
            };
            refresh = Some(sel);
            match self.find_scale_from_depth(&kp_ref, &kp_cur_sel, &e_pose.inv(), depth) {
                None => {
                    return ScaleOutput {
                        scale: None,
                        refresh,
                    }
                }
                Some(new_scale) => {
                    let delta = (new_scale - scale).abs();
                    scale = new_scale;
                    if delta < SCALE_CONVERGENCE_DELTA {
                        break;
                    }
                }
            }
        }
        ScaleOutput {
            scale: Some(scale),
            refresh,
        }
    }

    /// Triangulate the pair (reference camera at identity, current at
    /// `t21 = E.inv()`), scatter current-view depths and regress them
    /// against the predicted depth.
    fn find_scale_from_depth(
        &mut self,
        kp_ref: &[Point2<f64>],
        kp_cur: &[Point2<f64>],
        t21: &Se3,
        depth_pred: &DepthMap,
    ) -> Option<f64> {
        let (height, width) = depth_pred.shape();
        let norm_ref: Vec<Point2<f64>> =
            kp_ref.iter().map(|p| self.intrinsics.normalize(p)).collect();
        let norm_cur: Vec<Point2<f64>> =
            kp_cur.iter().map(|p| self.intrinsics.normalize(p)).collect();
        let (_, x_cur) = triangulation::triangulate(&norm_ref, &norm_cur, &Se3::identity(), t21);
        let depth_tri = triangulation::scatter_depth(kp_cur, &x_cur, height, width);

        let mut tri = Vec::new();
        let mut pred = Vec::new();
        for row in 0..height {
            for col in 0..width {
                let p = depth_pred[(row, col)] as f64;
                let t = depth_tri[(row, col)] as f64;
                if p > 0.0 && t > 0.0 {
                    tri.push(t);
                    pred.push(p);
                }
            }
        }
        if tri.len() <= MIN_SCALE_PIXELS {
            debug!(pixels = tri.len(), "scale recovery: too few matched depths");
            return None;
        }

        let regressor = RansacRegressor::new(&self.scale_cfg.ransac);
        let fit = match self.scale_cfg.ransac.method {
            RegressionMethod::DepthRatio => {
                let ratio: Vec<f64> = tri.iter().zip(pred.iter()).map(|(t, p)| t / p).collect();
                let ones = vec![1.0; ratio.len()];
                regressor.fit(&ratio, &ones, &mut self.rng)
            }
            RegressionMethod::AbsDiff => regressor.fit(&tri, &pred, &mut self.rng),
        }?;
        (fit.coef.is_finite() && fit.coef > 0.0).then_some(fit.coef)
    }
}

/// `kp_best` restricted to the last solve's inliers, when available.
fn inlier_filtered_best(
    cur: &FrameBuffer,
    reference: &FrameBuffer,
) -> Option<(Vec<Point2<f64>>, Vec<Point2<f64>>)> {
    let kp_ref = reference.kp_best.as_ref()?;
    let kp_cur = cur.kp_best.as_ref()?;
    let inliers = reference.inliers.as_ref()?;
    if inliers.len() != kp_ref.len() || kp_ref.len() != kp_cur.len() {
        return None;
    }
    let filter = |kps: &[Point2<f64>]| {
        kps.iter()
            .zip(inliers.iter())
            .filter(|(_, &m)| m)
            .map(|(p, _)| *p)
            .collect::<Vec<_>>()
    };
    Some((filter(kp_ref), filter(kp_cur)))
}

/// One independent repeated-RANSAC iteration over permuted keypoints.
fn find_essential_once(input: IterationInput<'_>) -> IterationRecord {
    let n = input.total;
    let mut rng = SmallRng::seed_from_u64(input.seed);
    let solved = epipolar::find_essential(
        &input.kp_cur,
        &input.kp_ref,
        input.intrinsics,
        input.cfg.ransac.reproj_thre,
        RANSAC_PROB,
        &mut rng,
    );
    let (e, inliers) = match solved {
        Ok(v) => v,
        Err(err) => {
            debug!(error = %err, "essential iteration failed");
            return IterationRecord {
                e: None,
                valid: false,
                record_ok: false,
                inlier_cnt: 0,
                inliers: vec![false; n],
            };
        }
    };
    let inlier_cnt = inliers.iter().filter(|&&m| m).count();
    let (valid, record_ok) = match input.cfg.validity.method {
        ValidityMethod::HomoRatio => {
            let denom = (input.h_inlier_count + inlier_cnt) as f64;
            let valid = denom > 0.0
                && (input.h_inlier_count as f64 / denom) < input.cfg.validity.thre;
            (valid, true)
        }
        ValidityMethod::Flow => {
            match epipolar::recover_pose(&e, &input.kp_cur, &input.kp_ref, input.intrinsics) {
                Ok((_, _, cheirality)) => {
                    let ok = cheirality as f64 > n as f64 * CHEIRALITY_VALID_RATIO;
                    (ok, ok)
                }
                Err(_) => (false, false),
            }
        }
    };
    IterationRecord {
        e: Some(e),
        valid,
        record_ok,
        inlier_cnt,
        inliers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::KeypointSampler;
    use nalgebra::{DMatrix, Matrix3, Vector3};
    use vo_geometry::ops;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.kp_selection.num_kp = 300;
        cfg.kp_selection.min_kp = 30;
        cfg
    }

    fn camera() -> Intrinsics {
        Intrinsics::new(32.0, 24.0, 60.0, 60.0)
    }

    fn wavy_depth(height: usize, width: usize) -> DMatrix<f32> {
        DMatrix::from_fn(height, width, |r, c| {
            6.0 + (c as f32 / 5.0).sin() + (r as f32 / 4.0).cos()
        })
    }

    /// A frame pair whose flow is exactly the rigid flow of `pose`.
    fn synthetic_pair(pose: &Se3) -> (FrameBuffer, FrameBuffer) {
        let k = camera();
        let depth = wavy_depth(48, 64);
        let (flow, _) = ops::rigid_flow(&depth, &k, pose);
        // A deterministic error pattern spreads the ranked keypoints over
        // the whole image instead of the tie-broken top rows.
        let flow_diff = DMatrix::from_fn(48, 64, |r, c| ((r * 31 + c * 17) % 97) as f32 / 1000.0);
        let cur = FrameBuffer {
            id: 1,
            flow: Some(flow),
            flow_diff: Some(flow_diff),
            depth: Some(depth.clone()),
            ..Default::default()
        };
        let reference = FrameBuffer {
            depth: Some(depth),
            ..Default::default()
        };
        (cur, reference)
    }

    fn select_kp(cfg: &Config, cur: &mut FrameBuffer, reference: &mut FrameBuffer) {
        let sampler = KeypointSampler::new(cfg.kp_selection.clone());
        let sel = sampler.kp_selection(cur, reference).unwrap();
        assert!(sel.good_kp_found);
        sampler.update_kp_data(cur, reference, sel);
    }

    #[test]
    fn translation_recovers_direction_and_scale() {
        let cfg = test_config();
        let truth = Se3::new(Matrix3::identity(), Vector3::new(0.3, 0.0, 0.05));
        let (mut cur, mut reference) = synthetic_pair(&truth);
        select_kp(&cfg, &mut cur, &mut reference);
        let mut tracker = EssTracker::new(&cfg, camera());

        let kp_ref = reference.kp_best.clone().unwrap();
        let kp_cur = cur.kp_best.clone().unwrap();
        let out = tracker.compute_pose_2d2d(&kp_ref, &kp_cur, true);
        assert_eq!(out.inliers.len(), kp_cur.len());
        assert!((out.pose.r - truth.r).norm() < 1e-3);
        assert!((out.pose.t.norm() - 1.0).abs() < 1e-9);
        let dir = truth.t / truth.t.norm();
        assert!((out.pose.t - dir).norm() < 1e-3);

        reference.inliers = Some(out.inliers.clone());
        let scale = tracker.scale_recovery(&cur, &reference, &out.pose);
        let s = scale.scale.unwrap();
        let err = (out.pose.t * s - truth.t).norm() / truth.t.norm();
        assert!(err < 1e-3, "scale error {err}");
        assert!((tracker.prev_scale() - s).abs() < 1e-12);
    }

    #[test]
    fn abs_diff_regression_agrees_with_depth_ratio() {
        let mut cfg = test_config();
        cfg.scale_recovery.ransac.method = RegressionMethod::AbsDiff;
        cfg.scale_recovery.ransac.thre = 0.5;
        let truth = Se3::new(Matrix3::identity(), Vector3::new(0.25, 0.0, 0.0));
        let (mut cur, mut reference) = synthetic_pair(&truth);
        select_kp(&cfg, &mut cur, &mut reference);
        let mut tracker = EssTracker::new(&cfg, camera());
        let kp_ref = reference.kp_best.clone().unwrap();
        let kp_cur = cur.kp_best.clone().unwrap();
        let out = tracker.compute_pose_2d2d(&kp_ref, &kp_cur, true);
        let scale = tracker.scale_recovery(&cur, &reference, &out.pose);
        let s = scale.scale.unwrap();
        assert!((out.pose.t * s - truth.t).norm() / truth.t.norm() < 1e-3);
    }

    #[test]
    fn iterative_scale_converges_and_refreshes_keypoints() {
        let mut cfg = test_config();
        cfg.scale_recovery.method = ScaleMethod::Iterative;
        // The warm start (previous scale, initially 1) must stay within the
        // rigid-flow mask threshold of the true scale for the first round.
        let truth = Se3::new(Matrix3::identity(), Vector3::new(0.8, 0.0, 0.0));
        let (mut cur, mut reference) = synthetic_pair(&truth);
        select_kp(&cfg, &mut cur, &mut reference);
        let mut tracker = EssTracker::new(&cfg, camera());
        let kp_ref = reference.kp_best.clone().unwrap();
        let kp_cur = cur.kp_best.clone().unwrap();
        let out = tracker.compute_pose_2d2d(&kp_ref, &kp_cur, true);
        let scale = tracker.scale_recovery(&cur, &reference, &out.pose);
        assert!(scale.refresh.is_some());
        let s = scale.scale.unwrap();
        assert!((out.pose.t * s - truth.t).norm() / truth.t.norm() < 1e-3);
    }

    #[test]
    fn static_pair_fails_the_flow_precheck() {
        let cfg = test_config();
        let (mut cur, mut reference) = synthetic_pair(&Se3::identity());
        select_kp(&cfg, &mut cur, &mut reference);
        let mut tracker = EssTracker::new(&cfg, camera());
        let kp_ref = reference.kp_best.clone().unwrap();
        let kp_cur = cur.kp_best.clone().unwrap();
        let out = tracker.compute_pose_2d2d(&kp_ref, &kp_cur, true);
        assert!(out.pose.is_identity());
        assert!(out.inliers.iter().all(|&m| m));
    }

    #[test]
    fn pure_rotation_returns_identity() {
        let cfg = test_config();
        let truth = Se3::new(
            nalgebra::Rotation3::from_euler_angles(0.0, 0.06, 0.0).into_inner(),
            Vector3::zeros(),
        );
        let (mut cur, mut reference) = synthetic_pair(&truth);
        select_kp(&cfg, &mut cur, &mut reference);
        let mut tracker = EssTracker::new(&cfg, camera());
        let kp_ref = reference.kp_best.clone().unwrap();
        let kp_cur = cur.kp_best.clone().unwrap();
        let out = tracker.compute_pose_2d2d(&kp_ref, &kp_cur, true);
        assert!(out.pose.t.norm() == 0.0, "rotation-only pair must not yield a translation");
    }

    #[test]
    fn pool_variant_matches_serial() {
        let cfg = test_config();
        let truth = Se3::new(Matrix3::identity(), Vector3::new(0.2, 0.05, 0.0));
        let (mut cur, mut reference) = synthetic_pair(&truth);
        select_kp(&cfg, &mut cur, &mut reference);
        let kp_ref = reference.kp_best.clone().unwrap();
        let kp_cur = cur.kp_best.clone().unwrap();
        let serial = EssTracker::new(&cfg, camera()).compute_pose_2d2d(&kp_ref, &kp_cur, true);
        let pooled = EssTracker::new(&cfg, camera()).compute_pose_2d2d_mp(&kp_ref, &kp_cur, true);
        assert!((serial.pose.r - pooled.pose.r).norm() < 1e-12);
        assert!((serial.pose.t - pooled.pose.t).norm() < 1e-12);
        assert_eq!(serial.inliers, pooled.inliers);
    }
}
