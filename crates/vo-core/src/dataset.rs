//! Dataset adapters: enumerate frames, load images/depth/ground truth and
//! expose intrinsics at the processed resolution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::RgbImage;
use nalgebra::DMatrix;
use tracing::info;
use vo_geometry::{DepthMap, Intrinsics, Se3};

use crate::config::{Config, DepthSrc};
use crate::{trajectory, Error, Result};

/// Narrow contract the orchestrator drives a sequence through.
pub trait SequenceSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_timestamp(&self, id: i64) -> Result<i64>;

    fn get_image(&self, timestamp: i64) -> Result<RgbImage>;

    fn get_depth(&self, timestamp: i64) -> Result<DepthMap>;

    fn get_gt_poses(&self) -> Result<BTreeMap<i64, Se3>>;

    /// Intrinsics already rescaled to the processed resolution.
    fn cam_intrinsics(&self) -> &Intrinsics;

    fn depth_src(&self) -> Option<DepthSrc>;

    fn save_result_traj(&self, path: &Path, poses: &BTreeMap<i64, Se3>) -> Result<()> {
        trajectory::save_kitti(path, poses)
    }
}

/// Directory of `{timestamp:06}.{ext}` frames with a `cam.txt` intrinsics
/// matrix, optional 16-bit PNG depth and optional KITTI ground truth.
pub struct ImageSequence {
    img_dir: PathBuf,
    depth_dir: Option<PathBuf>,
    gt_pose_file: Option<PathBuf>,
    intrinsics: Intrinsics,
    len: usize,
    width: u32,
    height: u32,
    ext: String,
    depth_src: Option<DepthSrc>,
    max_depth: f32,
}

impl ImageSequence {
    pub fn open(cfg: &Config) -> Result<Self> {
        let img_dir = cfg.directory.img_seq_dir.join(&cfg.seq);
        let len = count_frames(&img_dir, &cfg.image.ext)?;
        if len == 0 {
            return Err(Error::Dataset(format!(
                "no .{} frames under {}",
                cfg.image.ext,
                img_dir.display()
            )));
        }

        let first = img_dir.join(format!("{:06}.{}", 0, cfg.image.ext));
        let (native_w, native_h) = image::image_dimensions(&first)?;
        let k = parse_intrinsics_matrix(&std::fs::read_to_string(img_dir.join("cam.txt"))?)?;
        let intrinsics = rescale_intrinsics(
            &k,
            cfg.image.width as f64 / native_w as f64,
            cfg.image.height as f64 / native_h as f64,
        );
        info!(
            frames = len,
            native = format!("{native_w}x{native_h}").as_str(),
            processed = format!("{}x{}", cfg.image.width, cfg.image.height).as_str(),
            "opened image sequence"
        );

        Ok(Self {
            img_dir,
            depth_dir: cfg.directory.depth_dir.as_ref().map(|d| d.join(&cfg.seq)),
            gt_pose_file: cfg
                .directory
                .gt_pose_dir
                .as_ref()
                .map(|d| d.join(format!("{}.txt", cfg.seq))),
            intrinsics,
            len,
            width: cfg.image.width,
            height: cfg.image.height,
            ext: cfg.image.ext.clone(),
            depth_src: cfg.depth.depth_src,
            max_depth: cfg.depth.max_depth,
        })
    }
}

impl SequenceSource for ImageSequence {
    fn len(&self) -> usize {
        self.len
    }

    fn get_timestamp(&self, id: i64) -> Result<i64> {
        if id < 0 || id as usize >= self.len {
            return Err(Error::Dataset(format!("frame id {id} out of range")));
        }
        Ok(id)
    }

    fn get_image(&self, timestamp: i64) -> Result<RgbImage> {
        let path = self.img_dir.join(format!("{timestamp:06}.{}", self.ext));
        let img = image::open(&path)?;
        Ok(img
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8())
    }

    fn get_depth(&self, timestamp: i64) -> Result<DepthMap> {
        let dir = self
            .depth_dir
            .as_ref()
            .ok_or(Error::DataUnavailable("depth directory not configured"))?;
        let path = dir.join(format!("{timestamp:06}.png"));
        load_depth_png(&path, self.width, self.height, self.max_depth)
    }

    fn get_gt_poses(&self) -> Result<BTreeMap<i64, Se3>> {
        let path = self
            .gt_pose_file
            .as_ref()
            .ok_or(Error::DataUnavailable("ground-truth pose directory not configured"))?;
        let poses = trajectory::load_kitti(path)?;
        Ok(poses
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i as i64, p))
            .collect())
    }

    fn cam_intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    fn depth_src(&self) -> Option<DepthSrc> {
        self.depth_src
    }
}

/// 16-bit PNG depth, value/256 metres; zero and far values are missing.
pub(crate) fn load_depth_png(
    path: &Path,
    width: u32,
    height: u32,
    max_depth: f32,
) -> Result<DepthMap> {
    let img = image::open(path)?.to_luma16();
    let img = image::imageops::resize(&img, width, height, FilterType::Nearest);
    Ok(DMatrix::from_fn(height as usize, width as usize, |r, c| {
        let d = img.get_pixel(c as u32, r as u32)[0] as f32 / 256.0;
        if d > 0.0 && d <= max_depth {
            d
        } else {
            0.0
        }
    }))
}

fn count_frames(dir: &Path, ext: &str) -> Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)
        .map_err(|e| Error::Dataset(format!("cannot read {}: {e}", dir.display())))?
    {
        let path = entry?.path();
        if path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case(ext))
        {
            count += 1;
        }
    }
    Ok(count)
}

/// Parse a whitespace-separated 3×3 intrinsics matrix.
fn parse_intrinsics_matrix(s: &str) -> Result<[f64; 9]> {
    let values: Vec<f64> = s
        .split_whitespace()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|e| Error::Dataset(format!("bad cam.txt value {tok:?}: {e}")))
        })
        .collect::<Result<_>>()?;
    if values.len() != 9 {
        return Err(Error::Dataset(format!(
            "cam.txt has {} values, expected 9",
            values.len()
        )));
    }
    let mut k = [0.0; 9];
    k.copy_from_slice(&values);
    Ok(k)
}

/// Rescale a native-resolution K to the processed resolution.
fn rescale_intrinsics(k: &[f64; 9], sx: f64, sy: f64) -> Intrinsics {
    Intrinsics::new(k[2] * sx, k[5] * sy, k[0] * sx, k[4] * sy)
}
