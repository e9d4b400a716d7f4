//! Runtime configuration, loaded from YAML.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Per-frame pose estimation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingMethod {
    #[serde(rename = "hybrid")]
    Hybrid,
    #[serde(rename = "PnP")]
    Pnp,
    #[serde(rename = "deep_pose")]
    DeepPose,
}

/// Which keypoint set a tracker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpSource {
    KpBest,
    KpDepth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityMethod {
    Flow,
    HomoRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleMethod {
    Single,
    Iterative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegressionMethod {
    DepthRatio,
    AbsDiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthSrc {
    Gt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tracking_method: TrackingMethod,
    pub seq: String,
    pub seed: u64,
    pub frame_step: usize,
    pub use_multiprocessing: bool,
    pub image: ImageConfig,
    pub directory: DirectoryConfig,
    pub depth: DepthConfig,
    pub compute_2d2d_pose: Pose2d2dConfig,
    pub kp_selection: KpSelectionConfig,
    pub e_tracker: ETrackerConfig,
    pub pnp_tracker: PnpTrackerConfig,
    pub scale_recovery: ScaleRecoveryConfig,
    pub online_finetune: OnlineFinetuneConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tracking_method: TrackingMethod::Hybrid,
            seq: "00".into(),
            seed: 0,
            frame_step: 1,
            use_multiprocessing: false,
            image: ImageConfig::default(),
            directory: DirectoryConfig::default(),
            depth: DepthConfig::default(),
            compute_2d2d_pose: Pose2d2dConfig::default(),
            kp_selection: KpSelectionConfig::default(),
            e_tracker: ETrackerConfig::default(),
            pnp_tracker: PnpTrackerConfig::default(),
            scale_recovery: ScaleRecoveryConfig::default(),
            online_finetune: OnlineFinetuneConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }
}

/// Processed frame resolution; adapters rescale images and intrinsics to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub height: u32,
    pub width: u32,
    pub ext: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            height: 192,
            width: 640,
            ext: "png".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub img_seq_dir: PathBuf,
    /// Measured (ground-truth) depth maps, 16-bit PNG, value/256 metres.
    pub depth_dir: Option<PathBuf>,
    /// Predicted depth maps, same encoding as `depth_dir`.
    pub pred_depth_dir: Option<PathBuf>,
    /// Precomputed dense flow, Middlebury `.flo`.
    pub flow_dir: Option<PathBuf>,
    pub gt_pose_dir: Option<PathBuf>,
    pub result_dir: PathBuf,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            img_seq_dir: "dataset/sequences".into(),
            depth_dir: None,
            pred_depth_dir: None,
            flow_dir: None,
            gt_pose_dir: None,
            result_dir: "results".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConfig {
    pub depth_src: Option<DepthSrc>,
    /// Measurements beyond this are treated as missing.
    pub max_depth: f32,
}

impl Default for DepthConfig {
    fn default() -> Self {
        Self {
            depth_src: None,
            max_depth: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Pose2d2dConfig {
    pub validity: ValidityConfig,
    pub ransac: EssRansacConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidityConfig {
    pub method: ValidityMethod,
    pub thre: f64,
}

impl Default for ValidityConfig {
    fn default() -> Self {
        Self {
            method: ValidityMethod::Flow,
            thre: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EssRansacConfig {
    /// Whole-RANSAC repetitions entering the majority vote.
    pub repeat: usize,
    pub reproj_thre: f64,
}

impl Default for EssRansacConfig {
    fn default() -> Self {
        Self {
            repeat: 5,
            reproj_thre: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KpSelectionConfig {
    /// Keypoints drawn per frame pair.
    pub num_kp: usize,
    /// Below this many survivors the sampler reports failure.
    pub min_kp: usize,
    pub flow_consistency: FlowConsistencyConfig,
    pub depth_consistency: DepthConsistencyConfig,
    pub good_depth_kp: GoodDepthKpConfig,
}

impl Default for KpSelectionConfig {
    fn default() -> Self {
        Self {
            num_kp: 2000,
            min_kp: 50,
            flow_consistency: FlowConsistencyConfig::default(),
            depth_consistency: DepthConsistencyConfig::default(),
            good_depth_kp: GoodDepthKpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConsistencyConfig {
    /// Forward–backward flow error ceiling, pixels.
    pub thre: f64,
}

impl Default for FlowConsistencyConfig {
    fn default() -> Self {
        Self { thre: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthConsistencyConfig {
    pub enable: bool,
    /// Rigid-flow residual ceiling, pixels.
    pub thre: f64,
}

impl Default for DepthConsistencyConfig {
    fn default() -> Self {
        Self {
            enable: false,
            thre: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoodDepthKpConfig {
    pub enable: bool,
}

impl Default for GoodDepthKpConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ETrackerConfig {
    pub kp_src: KpSource,
    pub iterative_kp: IterativeKpConfig,
}

impl Default for ETrackerConfig {
    fn default() -> Self {
        Self {
            kp_src: KpSource::KpBest,
            iterative_kp: IterativeKpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeKpConfig {
    pub enable: bool,
    pub kp_src: KpSource,
}

impl Default for IterativeKpConfig {
    fn default() -> Self {
        Self {
            enable: false,
            kp_src: KpSource::KpDepth,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PnpTrackerConfig {
    pub kp_src: KpSource,
    pub ransac: PnpRansacConfig,
    pub iterative_kp: IterativeKpConfig,
}

impl Default for PnpTrackerConfig {
    fn default() -> Self {
        Self {
            kp_src: KpSource::KpBest,
            ransac: PnpRansacConfig::default(),
            iterative_kp: IterativeKpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PnpRansacConfig {
    pub iter: usize,
    pub reproj_thre: f64,
}

impl Default for PnpRansacConfig {
    fn default() -> Self {
        Self {
            iter: 100,
            reproj_thre: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleRecoveryConfig {
    pub method: ScaleMethod,
    pub kp_src: KpSource,
    pub ransac: ScaleRansacConfig,
    /// Whether the scale is re-estimated after keypoint refinement.
    pub iterative_kp: ScaleIterativeKpConfig,
}

impl Default for ScaleRecoveryConfig {
    fn default() -> Self {
        Self {
            method: ScaleMethod::Single,
            kp_src: KpSource::KpDepth,
            ransac: ScaleRansacConfig::default(),
            iterative_kp: ScaleIterativeKpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ScaleIterativeKpConfig {
    pub enable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleRansacConfig {
    pub method: RegressionMethod,
    pub min_samples: usize,
    pub max_trials: usize,
    pub stop_prob: f64,
    pub thre: f64,
}

impl Default for ScaleRansacConfig {
    fn default() -> Self {
        Self {
            method: RegressionMethod::DepthRatio,
            min_samples: 3,
            max_trials: 100,
            stop_prob: 0.99,
            thre: 0.1,
        }
    }
}

/// Parsed for config compatibility; the core never acts on it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OnlineFinetuneConfig {
    pub enable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_document() {
        let cfg = Config::from_yaml_str("{}").unwrap();
        assert_eq!(cfg.tracking_method, TrackingMethod::Hybrid);
        assert_eq!(cfg.compute_2d2d_pose.ransac.repeat, 5);
        assert_eq!(cfg.scale_recovery.ransac.min_samples, 3);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let cfg = Config::from_yaml_str(
            "tracking_method: PnP\ncompute_2d2d_pose:\n  validity:\n    method: homo_ratio\n    thre: 0.25\n",
        )
        .unwrap();
        assert_eq!(cfg.tracking_method, TrackingMethod::Pnp);
        assert_eq!(cfg.compute_2d2d_pose.validity.method, ValidityMethod::HomoRatio);
        assert_eq!(cfg.compute_2d2d_pose.validity.thre, 0.25);
        assert_eq!(cfg.compute_2d2d_pose.ransac.reproj_thre, 0.2);
        assert_eq!(cfg.frame_step, 1);
    }

    #[test]
    fn unknown_tracking_method_is_fatal() {
        assert!(Config::from_yaml_str("tracking_method: magic").is_err());
    }

    #[test]
    fn depth_src_accepts_gt_and_null() {
        let cfg = Config::from_yaml_str("depth:\n  depth_src: gt\n").unwrap();
        assert_eq!(cfg.depth.depth_src, Some(DepthSrc::Gt));
        let cfg = Config::from_yaml_str("depth:\n  depth_src: null\n").unwrap();
        assert_eq!(cfg.depth.depth_src, None);
    }
}
