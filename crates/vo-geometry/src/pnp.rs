//! Perspective-n-Point pose from 3D–2D correspondences.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::rngs::SmallRng;
use rand::seq::index;

use crate::{Error, Intrinsics, Result};

const MIN_CORRESPONDENCES: usize = 6;
const RANSAC_PROB: f64 = 0.99;

/// Solve the pose mapping object coordinates into the camera frame
/// (`X_cam = R·X + t`) from 3D points and their pixel observations,
/// with a DLT minimal solver inside RANSAC.
///
/// Inliers reproject within `reproj_thre` pixels and lie in front of the
/// camera. `max_iters` bounds the RANSAC trials.
pub fn solve_pnp(
    points3: &[Vector3<f64>],
    pixels: &[Point2<f64>],
    k: &Intrinsics,
    reproj_thre: f64,
    max_iters: usize,
    rng: &mut SmallRng,
) -> Result<(Matrix3<f64>, Vector3<f64>, Vec<bool>)> {
    let n = points3.len();
    if n < MIN_CORRESPONDENCES {
        return Err(Error::InsufficientCorrespondences {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }
    let normalized: Vec<Point2<f64>> = pixels.iter().map(|p| k.normalize(p)).collect();

    let mut best: Option<(Matrix3<f64>, Vector3<f64>, usize, Vec<bool>)> = None;
    let mut budget = max_iters.max(1);
    let mut iter = 0;
    while iter < budget {
        iter += 1;
        let sample = index::sample(rng, n, MIN_CORRESPONDENCES).into_vec();
        let model = dlt_pose(sample.iter().map(|&i| (&points3[i], &normalized[i])));
        let (r, t) = match model {
            Some(m) => m,
            None => continue,
        };
        let (count, mask) = score(&r, &t, points3, pixels, k, reproj_thre);
        if count > best.as_ref().map_or(0, |b| b.2) {
            let ratio = count as f64 / n as f64;
            let miss = 1.0 - ratio.powi(MIN_CORRESPONDENCES as i32);
            best = Some((r, t, count, mask));
            if miss <= f64::EPSILON {
                break;
            }
            let needed = ((1.0 - RANSAC_PROB).ln() / miss.ln()).ceil() as usize;
            budget = budget.min(needed.max(iter));
        }
    }

    let (r, t, count, mask) = best.ok_or(Error::Degenerate("pnp ransac found no model"))?;
    if count < MIN_CORRESPONDENCES {
        return Err(Error::Degenerate("pnp consensus set too small"));
    }
    let refit = dlt_pose(
        mask.iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| (&points3[i], &normalized[i])),
    );
    Ok(match refit {
        Some((r, t)) => {
            let (_, mask) = score(&r, &t, points3, pixels, k, reproj_thre);
            (r, t, mask)
        }
        None => (r, t, mask),
    })
}

/// 6-point DLT for the projection `[R|t]` over normalized observations,
/// followed by orthogonal projection of the rotation block onto SO(3).
fn dlt_pose<'a>(
    pairs: impl Iterator<Item = (&'a Vector3<f64>, &'a Point2<f64>)> + Clone,
) -> Option<(Matrix3<f64>, Vector3<f64>)> {
    let mut m = SMatrix::<f64, 12, 12>::zeros();
    let mut count = 0;
    for (x, p) in pairs.clone() {
        let row1 = SVector::<f64, 12>::from_row_slice(&[
            x.x,
            x.y,
            x.z,
            1.0,
            0.0,
            0.0,
            0.0,
            0.0,
            -p.x * x.x,
            -p.x * x.y,
            -p.x * x.z,
            -p.x,
        ]);
        let row2 = SVector::<f64, 12>::from_row_slice(&[
            0.0,
            0.0,
            0.0,
            0.0,
            x.x,
            x.y,
            x.z,
            1.0,
            -p.y * x.x,
            -p.y * x.y,
            -p.y * x.z,
            -p.y,
        ]);
        m += row1 * row1.transpose();
        m += row2 * row2.transpose();
        count += 1;
    }
    if count < MIN_CORRESPONDENCES {
        return None;
    }

    let eig = SymmetricEigen::new(m);
    let mut min_i = 0;
    for i in 1..12 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_i] {
            min_i = i;
        }
    }
    let p = eig.eigenvectors.column(min_i).into_owned();
    if !p.iter().all(|x| x.is_finite()) {
        return None;
    }
    let mut rot = Matrix3::new(p[0], p[1], p[2], p[4], p[5], p[6], p[8], p[9], p[10]);
    let mut trans = Vector3::new(p[3], p[7], p[11]);
    // The null vector is defined up to sign; pick the one with a proper
    // rotation block.
    if rot.determinant() < 0.0 {
        rot = -rot;
        trans = -trans;
    }

    let svd = rot.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let scale = svd.singular_values.sum() / 3.0;
    if scale <= 0.0 {
        return None;
    }
    let r = u * v_t;
    let t = trans / scale;

    // A solution putting the sample behind the camera is degenerate.
    let in_front = pairs.filter(|(x, _)| (r * *x + t).z > 0.0).count();
    if in_front < MIN_CORRESPONDENCES {
        return None;
    }
    Some((r, t))
}

fn score(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    points3: &[Vector3<f64>],
    pixels: &[Point2<f64>],
    k: &Intrinsics,
    thre: f64,
) -> (usize, Vec<bool>) {
    let thre_sq = thre * thre;
    let mut mask = Vec::with_capacity(points3.len());
    let mut count = 0;
    for (x, p) in points3.iter().zip(pixels.iter()) {
        let cam = r * x + t;
        let inlier = match k.project_point(&cam) {
            Some(proj) => {
                let dx = proj.x - p.x;
                let dy = proj.y - p.y;
                dx * dx + dy * dy < thre_sq
            }
            None => false,
        };
        mask.push(inlier);
        count += inlier as usize;
    }
    (count, mask)
}
