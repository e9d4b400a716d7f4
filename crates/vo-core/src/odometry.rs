//! Per-frame orchestrator: ingests frames, routes between trackers and
//! integrates relative poses into the global trajectory.

use std::collections::BTreeMap;
use std::time::Instant;

use image::RgbImage;
use nalgebra::{DMatrix, Point2};
use tracing::{debug, info, warn};
use vo_geometry::{DepthMap, FlowField, Intrinsics, Se3};

use crate::config::{Config, DepthSrc, KpSource, TrackingMethod};
use crate::consistency::DepthConsistency;
use crate::dataset::SequenceSource;
use crate::frame::FrameBuffer;
use crate::perception::PerceptionSource;
use crate::sampler::{GoodDepthSelection, KeypointSampler};
use crate::timer::Timer;
use crate::tracker::{EssTracker, PnpTracker, TrackingMode};
use crate::{Error, Result};

/// Everything the pipeline may receive for one frame.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    pub id: i64,
    pub timestamp: i64,
    pub img: Option<RgbImage>,
    pub raw_depth: Option<DepthMap>,
    pub depth: Option<DepthMap>,
    /// Dense displacement current→reference for the pair with the
    /// previous processed frame.
    pub flow: Option<FlowField>,
    pub flow_diff: Option<DMatrix<f32>>,
    pub deep_pose: Option<Se3>,
}

pub struct VisualOdometry {
    cfg: Config,
    sampler: KeypointSampler,
    depth_consistency: Option<DepthConsistency>,
    e_tracker: Option<EssTracker>,
    pnp_tracker: Option<PnpTracker>,
    cur: FrameBuffer,
    reference: FrameBuffer,
    global_pose: Se3,
    global_poses: BTreeMap<i64, Se3>,
    initial_pose: Option<Se3>,
    tracking_stage: u64,
    tracking_mode: TrackingMode,
    timers: Timer,
}

impl VisualOdometry {
    pub fn new(cfg: Config, intrinsics: Intrinsics) -> Result<Self> {
        let (e_tracker, pnp_tracker) = match cfg.tracking_method {
            TrackingMethod::Hybrid => (
                Some(EssTracker::new(&cfg, intrinsics)),
                Some(PnpTracker::new(&cfg, intrinsics)),
            ),
            TrackingMethod::Pnp => (None, Some(PnpTracker::new(&cfg, intrinsics))),
            TrackingMethod::DeepPose => (None, None),
        };
        let depth_consistency = cfg
            .kp_selection
            .depth_consistency
            .enable
            .then(|| DepthConsistency::new(cfg.kp_selection.clone(), intrinsics));
        Ok(Self {
            sampler: KeypointSampler::new(cfg.kp_selection.clone()),
            depth_consistency,
            e_tracker,
            pnp_tracker,
            cur: FrameBuffer::default(),
            reference: FrameBuffer::default(),
            global_pose: Se3::identity(),
            global_poses: BTreeMap::new(),
            initial_pose: None,
            tracking_stage: 0,
            tracking_mode: TrackingMode::EssentialMatrix,
            timers: Timer::new(),
            cfg,
        })
    }

    /// Seed the chain with a known pose for the first frame (e.g. ground
    /// truth). Must be called before the first frame is processed.
    pub fn set_initial_pose(&mut self, pose: Se3) {
        self.initial_pose = Some(pose);
    }

    pub fn global_poses(&self) -> &BTreeMap<i64, Se3> {
        &self.global_poses
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking_mode
    }

    pub fn timers(&self) -> &Timer {
        &self.timers
    }

    /// Process one frame end to end: ingest, track, integrate, advance.
    pub fn process_frame(&mut self, input: FrameInput) -> Result<TrackingMode> {
        let frame_start = Instant::now();
        self.tracking_mode = TrackingMode::EssentialMatrix;

        self.cur.id = input.id;
        self.cur.timestamp = input.timestamp;
        self.cur.img = input.img;
        self.cur.depth = input.depth.or_else(|| input.raw_depth.clone());
        self.cur.raw_depth = input.raw_depth;
        self.cur.flow = input.flow;
        self.cur.flow_diff = input.flow_diff;
        self.reference.deep_pose = input.deep_pose;

        let t = Instant::now();
        self.track_pair()?;
        self.timers.record("tracking", t.elapsed());

        self.advance();
        self.timers.record("frame", frame_start.elapsed());
        Ok(self.tracking_mode)
    }

    /// Drive a whole sequence from dataset and perception adapters.
    pub fn run<D, P>(&mut self, dataset: &D, perception: &P) -> Result<()>
    where
        D: SequenceSource,
        P: PerceptionSource,
    {
        info!(
            sequence = %self.cfg.seq,
            frames = dataset.len(),
            method = ?self.cfg.tracking_method,
            "starting visual odometry"
        );
        if self.cfg.directory.gt_pose_dir.is_some() {
            match dataset.get_gt_poses() {
                Ok(gt) => {
                    if let Some(first) = gt.values().next() {
                        self.set_initial_pose(first.clone());
                    }
                }
                Err(e) => warn!(error = %e, "ground-truth poses unavailable, seeding identity"),
            }
        }

        let step = self.cfg.frame_step.max(1);
        let mut prev_id: Option<i64> = None;
        for id in (0..dataset.len() as i64).step_by(step) {
            let t = Instant::now();
            let timestamp = dataset.get_timestamp(id)?;
            let img = dataset.get_image(timestamp)?;
            let raw_depth = match dataset.depth_src() {
                Some(DepthSrc::Gt) => Some(dataset.get_depth(timestamp)?),
                None => None,
            };
            let depth = perception.depth(timestamp)?;
            let (flow, flow_diff, deep_pose) = match prev_id {
                Some(ref_id) => (
                    perception.flow(id, ref_id)?,
                    perception.flow_diff(id, ref_id)?,
                    perception.deep_pose(id, ref_id)?,
                ),
                None => (None, None, None),
            };
            self.timers.record("data_loading", t.elapsed());

            let mode = self.process_frame(FrameInput {
                id,
                timestamp,
                img: Some(img),
                raw_depth,
                depth,
                flow,
                flow_diff,
                deep_pose,
            })?;
            debug!(frame = id, mode = mode.as_str(), "frame tracked");
            prev_id = Some(id);
        }
        info!(frames = self.global_poses.len(), "sequence finished");
        Ok(())
    }

    fn track_pair(&mut self) -> Result<()> {
        if self.tracking_stage == 0 {
            self.global_pose = self.initial_pose.clone().unwrap_or_else(Se3::identity);
            self.global_poses.insert(self.cur.id, self.global_pose.clone());
            self.cur.pose = Some(self.global_pose.clone());
            return Ok(());
        }

        let method = self.cfg.tracking_method;

        // Keypoint selection feeds both geometric trackers.
        if matches!(method, TrackingMethod::Hybrid | TrackingMethod::Pnp) {
            if self.cfg.kp_selection.depth_consistency.enable {
                if let Some(checker) = &self.depth_consistency {
                    let t = Instant::now();
                    let maps = checker.compute(&self.cur, &self.reference)?;
                    self.cur.rigid_flow_diff = Some(maps.rigid_flow_diff);
                    self.cur.rigid_flow_mask = Some(maps.rigid_flow_mask);
                    self.timers.record("depth_consistency", t.elapsed());
                }
            }

            let t = Instant::now();
            let sel = self.sampler.kp_selection(&self.cur, &self.reference)?;
            let good_kp_found = sel.good_kp_found;
            if good_kp_found {
                self.sampler.update_kp_data(&mut self.cur, &mut self.reference, sel);
            }
            self.timers.record("kp_sel", t.elapsed());

            if !good_kp_found {
                warn!(frame = self.cur.id, "not enough good keypoints, using constant motion");
                let rel = self.reference.motion.clone().unwrap_or_else(Se3::identity);
                self.update_global_pose(&rel, 1.0);
                return Ok(());
            }
        }

        let mut hybrid_pose = Se3::identity();
        let mut e_pose = Se3::identity();
        let mut last_scale: Option<f64> = None;
        let mut scale_failed = false;

        if method == TrackingMethod::Hybrid {
            let (kp_ref, kp_cur) = self.kp_pair(self.cfg.e_tracker.kp_src)?;
            let finalize = !self.cfg.e_tracker.iterative_kp.enable;
            let t = Instant::now();
            let tracker = self
                .e_tracker
                .as_mut()
                .ok_or(Error::Unsupported("essential tracker not initialized"))?;
            let out = tracker.compute_pose(&kp_ref, &kp_cur, finalize);
            self.timers.record("e_tracker", t.elapsed());
            e_pose = out.pose.clone();
            hybrid_pose.r = e_pose.r;
            self.reference.inliers = Some(out.inliers);

            if e_pose.t.norm() != 0.0 {
                let t = Instant::now();
                let tracker = self
                    .e_tracker
                    .as_mut()
                    .ok_or(Error::Unsupported("essential tracker not initialized"))?;
                let out = tracker.scale_recovery(&self.cur, &self.reference, &e_pose);
                self.timers.record("scale_recovery", t.elapsed());
                if let Some(refresh) = out.refresh {
                    if self.cfg.scale_recovery.kp_src == KpSource::KpDepth {
                        self.apply_refresh(refresh);
                    }
                }
                match out.scale {
                    Some(s) => {
                        hybrid_pose.t = e_pose.t * s;
                        last_scale = Some(s);
                    }
                    None => scale_failed = true,
                }
            }

            // Iterative keypoint refinement under the current estimate.
            if e_pose.t.norm() != 0.0 && self.cfg.e_tracker.iterative_kp.enable {
                let t = Instant::now();
                let tracker = self
                    .e_tracker
                    .as_ref()
                    .ok_or(Error::Unsupported("essential tracker not initialized"))?;
                let sel = tracker.compute_rigid_flow_kp(&self.cur, &self.reference, &hybrid_pose)?;
                self.apply_refresh(sel);

                let (kp_ref, kp_cur) = self.kp_pair(self.cfg.e_tracker.iterative_kp.kp_src)?;
                let tracker = self
                    .e_tracker
                    .as_mut()
                    .ok_or(Error::Unsupported("essential tracker not initialized"))?;
                let out = tracker.compute_pose(&kp_ref, &kp_cur, true);
                e_pose = out.pose.clone();
                hybrid_pose.r = e_pose.r;
                self.reference.inliers = Some(out.inliers);

                if e_pose.t.norm() != 0.0 {
                    if self.cfg.scale_recovery.iterative_kp.enable {
                        let tracker = self
                            .e_tracker
                            .as_mut()
                            .ok_or(Error::Unsupported("essential tracker not initialized"))?;
                        let out = tracker.scale_recovery(&self.cur, &self.reference, &e_pose);
                        if let Some(refresh) = out.refresh {
                            if self.cfg.scale_recovery.kp_src == KpSource::KpDepth {
                                self.apply_refresh(refresh);
                            }
                        }
                        match out.scale {
                            Some(s) => {
                                hybrid_pose.t = e_pose.t * s;
                                last_scale = Some(s);
                            }
                            None => scale_failed = true,
                        }
                    } else if let Some(s) = last_scale {
                        // Without a re-estimate, the refined translation
                        // reuses the last accepted scale of this frame.
                        hybrid_pose.t = e_pose.t * s;
                    }
                }
                self.timers.record("e_tracker_iter", t.elapsed());
            }
        }

        if method == TrackingMethod::Pnp
            || (method == TrackingMethod::Hybrid && (e_pose.t.norm() == 0.0 || scale_failed))
        {
            match self.run_pnp()? {
                Some(pose) => {
                    hybrid_pose = pose;
                    self.tracking_mode = TrackingMode::Pnp;
                }
                None => {
                    warn!(frame = self.cur.id, "PnP unavailable, using constant motion");
                    let rel = self.reference.motion.clone().unwrap_or_else(Se3::identity);
                    self.update_global_pose(&rel, 1.0);
                    return Ok(());
                }
            }
        }

        if method == TrackingMethod::DeepPose {
            hybrid_pose = self
                .reference
                .deep_pose
                .clone()
                .ok_or(Error::DataUnavailable("deep pose for the pair"))?;
            self.tracking_mode = TrackingMode::DeepPose;
        }

        self.reference.pose = Some(hybrid_pose.clone());
        self.reference.motion = Some(hybrid_pose.clone());
        self.update_global_pose(&hybrid_pose, 1.0);
        Ok(())
    }

    /// PnP path; `Ok(None)` means it could not run and the caller should
    /// fall back to constant motion. Outright `PnP` tracking without depth
    /// is a configuration-level failure.
    fn run_pnp(&mut self) -> Result<Option<Se3>> {
        let Some(depth_ref) = self.reference.depth.clone() else {
            if self.cfg.tracking_method == TrackingMethod::Pnp {
                return Err(Error::DataUnavailable("reference depth for PnP tracking"));
            }
            return Ok(None);
        };
        let (kp_ref, kp_cur) = self.kp_pair(self.cfg.pnp_tracker.kp_src)?;
        let finalize = !self.cfg.pnp_tracker.iterative_kp.enable;
        let t = Instant::now();
        let tracker = self
            .pnp_tracker
            .as_mut()
            .ok_or(Error::Unsupported("pnp tracker not initialized"))?;
        let mut out = tracker.compute_pose_3d2d(&kp_ref, &kp_cur, &depth_ref, finalize);

        if self.cfg.pnp_tracker.iterative_kp.enable {
            if let Some(first_pose) = out.as_ref().map(|o| o.pose.clone()) {
                let tracker = self
                    .pnp_tracker
                    .as_ref()
                    .ok_or(Error::Unsupported("pnp tracker not initialized"))?;
                match tracker.compute_rigid_flow_kp(&self.cur, &self.reference, &first_pose) {
                    Ok(sel) => {
                        self.apply_refresh(sel);
                        let (kp_ref, kp_cur) =
                            self.kp_pair(self.cfg.pnp_tracker.iterative_kp.kp_src)?;
                        let tracker = self
                            .pnp_tracker
                            .as_mut()
                            .ok_or(Error::Unsupported("pnp tracker not initialized"))?;
                        if let Some(refined) =
                            tracker.compute_pose_3d2d(&kp_ref, &kp_cur, &depth_ref, true)
                        {
                            out = Some(refined);
                        }
                    }
                    Err(e) => debug!(error = %e, "pnp keypoint refinement skipped"),
                }
            }
        }
        self.timers.record("pnp", t.elapsed());

        Ok(out.map(|o| {
            self.reference.inliers = Some(o.inliers);
            o.pose
        }))
    }

    fn kp_pair(&self, src: KpSource) -> Result<(Vec<Point2<f64>>, Vec<Point2<f64>>)> {
        let kp_ref = self
            .reference
            .kp(src)
            .cloned()
            .ok_or(Error::DataUnavailable("reference-side keypoints"))?;
        let kp_cur = self
            .cur
            .kp(src)
            .cloned()
            .ok_or(Error::DataUnavailable("current-side keypoints"))?;
        Ok((kp_ref, kp_cur))
    }

    fn apply_refresh(&mut self, sel: GoodDepthSelection) {
        self.cur.kp_depth = Some(sel.kp_cur);
        self.reference.kp_depth = Some(sel.kp_ref);
        self.cur.rigid_flow_diff = Some(sel.rigid_flow_diff);
        self.cur.rigid_flow_mask = Some(sel.rigid_flow_mask);
    }

    /// Chain the relative pose onto the global trajectory; poses are
    /// stored by value so later buffer mutations cannot reach them.
    fn update_global_pose(&mut self, rel: &Se3, scale: f64) {
        self.global_pose.t = self.global_pose.r * rel.t * scale + self.global_pose.t;
        self.global_pose.r *= rel.r;
        self.global_poses.insert(self.cur.id, self.global_pose.clone());
        self.cur.pose = Some(self.global_pose.clone());
    }

    /// Current becomes reference; pair-scoped flow fields are dropped so
    /// nothing leaks into the next pair.
    fn advance(&mut self) {
        let carried_motion = self.reference.motion.clone();
        self.reference = std::mem::take(&mut self.cur);
        if self.reference.motion.is_none() {
            self.reference.motion = carried_motion;
        }
        self.reference.clear_pair_data();
        self.tracking_stage += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix3, Rotation3, Vector3};
    use vo_geometry::ops;

    fn camera() -> Intrinsics {
        Intrinsics::new(32.0, 24.0, 60.0, 60.0)
    }

    fn wavy_depth() -> DepthMap {
        DMatrix::from_fn(48, 64, |r, c| {
            6.0 + 0.8 * (c as f32 / 10.0).sin() + 0.6 * (r as f32 / 7.0).cos()
        })
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.kp_selection.num_kp = 300;
        cfg.kp_selection.min_kp = 30;
        cfg
    }

    fn bootstrap_input(id: i64, with_depth: bool) -> FrameInput {
        FrameInput {
            id,
            timestamp: id,
            depth: with_depth.then(wavy_depth),
            ..Default::default()
        }
    }

    /// A frame whose observed flow is exactly the rigid flow of `step`.
    fn moving_input(id: i64, step: &Se3, with_depth: bool) -> FrameInput {
        let depth = wavy_depth();
        let (flow, _) = ops::rigid_flow(&depth, &camera(), step);
        // A deterministic error pattern spreads the ranked keypoints over
        // the whole image instead of the tie-broken top rows.
        let flow_diff = DMatrix::from_fn(48, 64, |r, c| ((r * 31 + c * 17) % 97) as f32 / 1000.0);
        FrameInput {
            id,
            timestamp: id,
            depth: with_depth.then(|| depth),
            flow: Some(flow),
            flow_diff: Some(flow_diff),
            ..Default::default()
        }
    }

    fn assert_rotation_valid(pose: &Se3) {
        assert!((pose.r * pose.r.transpose() - Matrix3::identity()).norm() < 1e-6);
        let det = pose.r.determinant();
        assert!(det > 0.99 && det < 1.01);
    }

    #[test]
    fn straight_line_sequence_tracks_with_low_drift() {
        let step = Se3::new(Matrix3::identity(), Vector3::new(0.3, 0.0, 0.0));
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        vo.process_frame(bootstrap_input(0, true)).unwrap();
        for id in 1..10 {
            let mode = vo.process_frame(moving_input(id, &step, true)).unwrap();
            assert_eq!(mode, TrackingMode::EssentialMatrix, "frame {id}");
            assert!(vo.reference.flow.is_none(), "flow must be cleared on advance");
            assert!(vo.cur.flow_diff.is_none());
        }
        let poses = vo.global_poses();
        assert_eq!(poses.len(), 10);
        assert!(poses[&0].is_identity());
        for pose in poses.values() {
            assert_rotation_valid(pose);
        }
        let path_length = 9.0 * 0.3;
        let expected = Vector3::new(path_length, 0.0, 0.0);
        let drift = (poses[&9].t - expected).norm();
        assert!(drift < 0.01 * path_length, "drift {drift}");
    }

    #[test]
    fn identity_frames_fall_back_to_constant_motion() {
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        vo.process_frame(bootstrap_input(0, false)).unwrap();
        // Zero flow fails the essential validity pre-check and no depth is
        // available for PnP: the frame must coast without panicking.
        vo.process_frame(moving_input(1, &Se3::identity(), false)).unwrap();
        let poses = vo.global_poses();
        assert_eq!(poses[&1], poses[&0]);
    }

    #[test]
    fn missing_keypoints_coast_on_the_previous_motion() {
        let step = Se3::new(Matrix3::identity(), Vector3::new(0.3, 0.0, 0.0));
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        vo.process_frame(bootstrap_input(0, true)).unwrap();
        vo.process_frame(moving_input(1, &step, true)).unwrap();
        vo.process_frame(moving_input(2, &step, true)).unwrap();
        // Frame 3: forward-backward error everywhere above threshold.
        let mut input = moving_input(3, &step, true);
        input.flow_diff = Some(DMatrix::from_element(48, 64, 100.0f32));
        vo.process_frame(input).unwrap();
        let poses = vo.global_poses();
        let coasted = poses[&3].t - poses[&2].t;
        assert!((coasted - step.t).norm() < 1e-3, "constant motion must replay the last step");
    }

    #[test]
    fn degenerate_scale_escalates_to_pnp() {
        let step = Se3::new(Matrix3::identity(), Vector3::new(0.3, 0.0, 0.0));
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        vo.process_frame(bootstrap_input(0, true)).unwrap();
        let mode = vo.process_frame(moving_input(1, &step, true)).unwrap();
        assert_eq!(mode, TrackingMode::EssentialMatrix);
        // Frame 2 has no depth: scale recovery cannot run, but the
        // reference frame still carries depth for the PnP solve.
        let mode = vo.process_frame(moving_input(2, &step, false)).unwrap();
        assert_eq!(mode, TrackingMode::Pnp);
        let poses = vo.global_poses();
        let advanced = poses[&2].t - poses[&1].t;
        // Reference depth is sampled at rounded flow endpoints, so the PnP
        // estimate is close but not exact on this synthetic scene.
        assert!((advanced - step.t).norm() < 0.02);
    }

    #[test]
    fn forced_zero_translation_wires_through_pnp() {
        let rot = Se3::new(
            Rotation3::from_euler_angles(0.0, 0.05, 0.0).into_inner(),
            Vector3::zeros(),
        );
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        vo.process_frame(bootstrap_input(0, true)).unwrap();
        // Rotation-only flow leaves the essential translation at zero, so
        // the orchestrator must hand the frame to the PnP tracker.
        let mode = vo.process_frame(moving_input(1, &rot, true)).unwrap();
        assert_eq!(mode, TrackingMode::Pnp);
        let pose = &vo.global_poses()[&1];
        assert!((pose.r - rot.r).norm() < 1e-3);
        assert!(pose.t.norm() < 1e-3);
    }

    #[test]
    fn rotation_without_depth_coasts() {
        let rot = Se3::new(
            Rotation3::from_euler_angles(0.0, 0.05, 0.0).into_inner(),
            Vector3::zeros(),
        );
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        vo.process_frame(bootstrap_input(0, false)).unwrap();
        let mode = vo.process_frame(moving_input(1, &rot, false)).unwrap();
        assert_eq!(mode, TrackingMode::EssentialMatrix);
        assert_eq!(vo.global_poses()[&1], vo.global_poses()[&0]);
    }

    #[test]
    fn deep_pose_mode_composes_the_supplied_chain() {
        let mut cfg = test_config();
        cfg.tracking_method = TrackingMethod::DeepPose;
        let step = Se3::new(
            Rotation3::from_euler_angles(0.0, 0.01, 0.0).into_inner(),
            Vector3::new(0.1, 0.0, 0.02),
        );
        let mut vo = VisualOdometry::new(cfg, camera()).unwrap();
        vo.process_frame(bootstrap_input(0, false)).unwrap();
        let mut expected = Se3::identity();
        for id in 1..6 {
            let input = FrameInput {
                id,
                timestamp: id,
                deep_pose: Some(step.clone()),
                ..Default::default()
            };
            let mode = vo.process_frame(input).unwrap();
            assert_eq!(mode, TrackingMode::DeepPose);
            expected = expected.compose(&step);
        }
        let last = &vo.global_poses()[&5];
        assert!((last.r - expected.r).norm() < 1e-12);
        assert!((last.t - expected.t).norm() < 1e-12);
    }

    #[test]
    fn deep_pose_mode_without_input_is_fatal() {
        let mut cfg = test_config();
        cfg.tracking_method = TrackingMethod::DeepPose;
        let mut vo = VisualOdometry::new(cfg, camera()).unwrap();
        vo.process_frame(bootstrap_input(0, false)).unwrap();
        let err = vo.process_frame(bootstrap_input(1, false));
        assert!(matches!(err, Err(Error::DataUnavailable(_))));
    }

    #[test]
    fn ground_truth_seed_anchors_the_chain() {
        let mut vo = VisualOdometry::new(test_config(), camera()).unwrap();
        let seed = Se3::new(Matrix3::identity(), Vector3::new(5.0, 1.0, -2.0));
        vo.set_initial_pose(seed.clone());
        vo.process_frame(bootstrap_input(0, true)).unwrap();
        assert_eq!(vo.global_poses()[&0], seed);
        let step = Se3::new(Matrix3::identity(), Vector3::new(0.3, 0.0, 0.0));
        vo.process_frame(moving_input(1, &step, true)).unwrap();
        // The seed itself must never be rewritten.
        assert_eq!(vo.global_poses()[&0], seed);
        assert!((vo.global_poses()[&1].t - (seed.t + step.t)).norm() < 1e-3);
    }

    #[test]
    fn pure_pnp_tracking_method_works_end_to_end() {
        let mut cfg = test_config();
        cfg.tracking_method = TrackingMethod::Pnp;
        let step = Se3::new(Matrix3::identity(), Vector3::new(0.2, 0.0, 0.05));
        let mut vo = VisualOdometry::new(cfg, camera()).unwrap();
        vo.process_frame(bootstrap_input(0, true)).unwrap();
        for id in 1..4 {
            let mode = vo.process_frame(moving_input(id, &step, true)).unwrap();
            assert_eq!(mode, TrackingMode::Pnp);
        }
        let poses = vo.global_poses();
        let expected = Vector3::new(0.6, 0.0, 0.15);
        assert!((poses[&3].t - expected).norm() < 0.05);
    }
}
