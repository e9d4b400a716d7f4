//! Perception adapters: dense flow, predicted depth and optional deep
//! poses produced by external modules, loaded from disk.

use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use tracing::debug;
use vo_geometry::{DepthMap, FlowField, Se3};

use crate::config::Config;
use crate::dataset::load_depth_png;
use crate::{trajectory, Error, Result};

/// Middlebury `.flo` magic number.
const FLO_MAGIC: f32 = 202021.25;

/// Per-frame perception inputs for the pipeline.
pub trait PerceptionSource {
    /// Dense displacement current→reference for the pair, when available.
    fn flow(&self, cur_id: i64, ref_id: i64) -> Result<Option<FlowField>>;

    /// Forward–backward error map of the pair's flow.
    fn flow_diff(&self, _cur_id: i64, _ref_id: i64) -> Result<Option<DMatrix<f32>>> {
        Ok(None)
    }

    /// Predicted depth for the frame.
    fn depth(&self, timestamp: i64) -> Result<Option<DepthMap>>;

    /// Externally predicted relative pose for the pair.
    fn deep_pose(&self, _cur_id: i64, _ref_id: i64) -> Result<Option<Se3>> {
        Ok(None)
    }
}

/// Reads precomputed perception outputs:
/// `{flow_dir}/{seq}/{ref:06}_{cur:06}.flo`, predicted depth PNGs and an
/// optional `deep_pose.txt` (KITTI rows, line k = relative pose k→k−1).
pub struct PrecomputedPerception {
    flow_dir: Option<PathBuf>,
    pred_depth_dir: Option<PathBuf>,
    deep_poses: Vec<Se3>,
    width: u32,
    height: u32,
    max_depth: f32,
}

impl PrecomputedPerception {
    pub fn open(cfg: &Config) -> Result<Self> {
        let flow_dir = cfg.directory.flow_dir.as_ref().map(|d| d.join(&cfg.seq));
        let deep_poses = match &flow_dir {
            Some(dir) => {
                let path = dir.join("deep_pose.txt");
                if path.is_file() {
                    trajectory::load_kitti(&path)?
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        };
        if !deep_poses.is_empty() {
            debug!(poses = deep_poses.len(), "loaded precomputed deep poses");
        }
        Ok(Self {
            flow_dir,
            pred_depth_dir: cfg
                .directory
                .pred_depth_dir
                .as_ref()
                .map(|d| d.join(&cfg.seq)),
            deep_poses,
            width: cfg.image.width,
            height: cfg.image.height,
            max_depth: cfg.depth.max_depth,
        })
    }
}

impl PerceptionSource for PrecomputedPerception {
    fn flow(&self, cur_id: i64, ref_id: i64) -> Result<Option<FlowField>> {
        let Some(dir) = &self.flow_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{ref_id:06}_{cur_id:06}.flo"));
        read_flo(&path).map(Some)
    }

    fn depth(&self, timestamp: i64) -> Result<Option<DepthMap>> {
        let Some(dir) = &self.pred_depth_dir else {
            return Ok(None);
        };
        let path = dir.join(format!("{timestamp:06}.png"));
        load_depth_png(&path, self.width, self.height, self.max_depth).map(Some)
    }

    fn deep_pose(&self, cur_id: i64, _ref_id: i64) -> Result<Option<Se3>> {
        Ok(self.deep_poses.get(cur_id as usize).cloned())
    }
}

/// Parse a Middlebury `.flo` file: magic, width, height, then row-major
/// interleaved `(u, v)` little-endian floats.
pub fn read_flo(path: &Path) -> Result<FlowField> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Dataset(format!("cannot read {}: {e}", path.display())))?;
    if bytes.len() < 12 {
        return Err(Error::Dataset(format!("{} is truncated", path.display())));
    }
    let magic = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if magic != FLO_MAGIC {
        return Err(Error::Dataset(format!(
            "{} is not a .flo file (magic {magic})",
            path.display()
        )));
    }
    let width = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let height = i32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    if width <= 0 || height <= 0 {
        return Err(Error::Dataset(format!(
            "{} has invalid dimensions {width}x{height}",
            path.display()
        )));
    }
    let (width, height) = (width as usize, height as usize);
    let expected = 12 + width * height * 2 * 4;
    if bytes.len() != expected {
        return Err(Error::Dataset(format!(
            "{}: expected {expected} bytes, found {}",
            path.display(),
            bytes.len()
        )));
    }

    let mut flow = FlowField::zeros(height, width);
    let mut offset = 12;
    let mut read_f32 = || {
        let v = f32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        offset += 4;
        v
    };
    for row in 0..height {
        for col in 0..width {
            flow.u[(row, col)] = read_f32();
            flow.v[(row, col)] = read_f32();
        }
    }
    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_flo(path: &Path, height: usize, width: usize, gen: impl Fn(usize, usize) -> (f32, f32)) {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&FLO_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&(width as i32).to_le_bytes());
        bytes.extend_from_slice(&(height as i32).to_le_bytes());
        for row in 0..height {
            for col in 0..width {
                let (u, v) = gen(row, col);
                bytes.extend_from_slice(&u.to_le_bytes());
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn flo_round_trip() {
        let root = std::env::temp_dir().join("vo_core_flo_test");
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join("000000_000001.flo");
        write_flo(&path, 4, 6, |r, c| (c as f32 * 0.5, -(r as f32)));
        let flow = read_flo(&path).unwrap();
        assert_eq!((flow.height(), flow.width()), (4, 6));
        assert_eq!(flow.at(2, 3), (1.5, -2.0));
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn bad_magic_is_rejected() {
        let root = std::env::temp_dir().join("vo_core_flo_bad_test");
        std::fs::create_dir_all(&root).unwrap();
        let path = root.join("bad.flo");
        std::fs::write(&path, [0u8; 16]).unwrap();
        assert!(read_flo(&path).is_err());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn missing_flow_dir_returns_none() {
        let perception = PrecomputedPerception::open(&Config::default()).unwrap();
        assert!(perception.flow(1, 0).unwrap().is_none());
        assert!(perception.depth(0).unwrap().is_none());
        assert!(perception.deep_pose(1, 0).unwrap().is_none());
    }
}
