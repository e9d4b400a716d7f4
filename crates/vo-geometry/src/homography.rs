//! Planar homography fitting, used as a degeneracy check by the
//! Essential-matrix tracker.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::rngs::SmallRng;
use rand::seq::index;

use crate::{Error, Result};

const MIN_CORRESPONDENCES: usize = 4;
const MAX_RANSAC_ITERS: usize = 1000;

/// Fit `x_ref ~ H·x_cur` with RANSAC over pixel coordinates and return the
/// inlier mask (forward transfer error below `reproj_thre` pixels).
pub fn find_homography(
    kp_cur: &[Point2<f64>],
    kp_ref: &[Point2<f64>],
    reproj_thre: f64,
    prob: f64,
    rng: &mut SmallRng,
) -> Result<Vec<bool>> {
    let n = kp_cur.len();
    if n < MIN_CORRESPONDENCES {
        return Err(Error::InsufficientCorrespondences {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }
    let norm_cur = Normalizer::fit(kp_cur);
    let norm_ref = Normalizer::fit(kp_ref);

    let mut best: Option<(Matrix3<f64>, usize, Vec<bool>)> = None;
    let mut max_iters = MAX_RANSAC_ITERS;
    let mut iter = 0;
    while iter < max_iters {
        iter += 1;
        let sample = index::sample(rng, n, MIN_CORRESPONDENCES);
        let h = match dlt(sample.iter().map(|i| (kp_cur[i], kp_ref[i])), &norm_cur, &norm_ref) {
            Some(h) => h,
            None => continue,
        };
        let (count, mask) = score(&h, kp_cur, kp_ref, reproj_thre);
        if count > best.as_ref().map_or(0, |b| b.1) {
            let ratio = count as f64 / n as f64;
            let miss = 1.0 - ratio.powi(MIN_CORRESPONDENCES as i32);
            best = Some((h, count, mask));
            if miss <= f64::EPSILON {
                break;
            }
            let needed = ((1.0 - prob).ln() / miss.ln()).ceil() as usize;
            max_iters = max_iters.min(needed.max(iter));
        }
    }

    let (_, count, mask) = best.ok_or(Error::Degenerate("homography ransac found no model"))?;
    if count < MIN_CORRESPONDENCES {
        return Err(Error::Degenerate("homography consensus set too small"));
    }
    let refit = dlt(
        mask.iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| (kp_cur[i], kp_ref[i])),
        &norm_cur,
        &norm_ref,
    );
    Ok(match refit {
        Some(h) => score(&h, kp_cur, kp_ref, reproj_thre).1,
        None => mask,
    })
}

/// Hartley conditioning: translate to the centroid, scale the mean
/// distance to √2.
struct Normalizer {
    t: Matrix3<f64>,
    t_inv: Matrix3<f64>,
}

impl Normalizer {
    fn fit(points: &[Point2<f64>]) -> Self {
        let n = points.len() as f64;
        let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
        let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
        let mean_dist = points
            .iter()
            .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
            .sum::<f64>()
            / n;
        let s = if mean_dist > 0.0 {
            2f64.sqrt() / mean_dist
        } else {
            1.0
        };
        Self {
            t: Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0),
            t_inv: Matrix3::new(1.0 / s, 0.0, cx, 0.0, 1.0 / s, cy, 0.0, 0.0, 1.0),
        }
    }

    fn apply(&self, p: &Point2<f64>) -> Point2<f64> {
        let q = self.t * Vector3::new(p.x, p.y, 1.0);
        Point2::new(q.x, q.y)
    }
}

fn dlt(
    pairs: impl Iterator<Item = (Point2<f64>, Point2<f64>)>,
    norm_cur: &Normalizer,
    norm_ref: &Normalizer,
) -> Option<Matrix3<f64>> {
    let mut m = SMatrix::<f64, 9, 9>::zeros();
    let mut count = 0;
    for (c, r) in pairs {
        let c = norm_cur.apply(&c);
        let r = norm_ref.apply(&r);
        let row1 = SVector::<f64, 9>::from_row_slice(&[
            -c.x,
            -c.y,
            -1.0,
            0.0,
            0.0,
            0.0,
            r.x * c.x,
            r.x * c.y,
            r.x,
        ]);
        let row2 = SVector::<f64, 9>::from_row_slice(&[
            0.0,
            0.0,
            0.0,
            -c.x,
            -c.y,
            -1.0,
            r.y * c.x,
            r.y * c.y,
            r.y,
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
    for i in 1..9 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_i] {
            min_i = i;
        }
    }
    let h = eig.eigenvectors.column(min_i);
    if !h.iter().all(|x| x.is_finite()) {
        return None;
    }
    let h_norm = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);
    Some(norm_ref.t_inv * h_norm * norm_cur.t)
}

fn score(
    h: &Matrix3<f64>,
    kp_cur: &[Point2<f64>],
    kp_ref: &[Point2<f64>],
    thre: f64,
) -> (usize, Vec<bool>) {
    let thre_sq = thre * thre;
    let mut mask = Vec::with_capacity(kp_cur.len());
    let mut count = 0;
    for (c, r) in kp_cur.iter().zip(kp_ref.iter()) {
        let q = h * Vector3::new(c.x, c.y, 1.0);
        let inlier = q.z.abs() > 1e-12 && {
            let dx = q.x / q.z - r.x;
            let dy = q.y / q.z - r.y;
            dx * dx + dy * dy < thre_sq
        };
        mask.push(inlier);
        count += inlier as usize;
    }
    (count, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Intrinsics, Se3};
    use nalgebra::Vector3;
    use rand::SeedableRng;

    #[test]
    fn planar_scene_is_fully_explained() {
        let k = Intrinsics::new(320.0, 240.0, 320.0, 320.0);
        let pose = Se3::new(Matrix3::identity(), Vector3::new(0.1, 0.0, 0.0));
        let mut kp_cur = Vec::new();
        let mut kp_ref = Vec::new();
        for i in 0..40 {
            let x = -1.5 + (i % 8) as f64 * 0.4;
            let y = -1.0 + (i / 8) as f64 * 0.5;
            let p = Vector3::new(x, y, 2.0);
            let q = pose.transform(&p);
            kp_cur.push(Point2::new(k.fx * p.x / p.z + k.cx, k.fy * p.y / p.z + k.cy));
            kp_ref.push(Point2::new(k.fx * q.x / q.z + k.cx, k.fy * q.y / q.z + k.cy));
        }
        let mut rng = SmallRng::seed_from_u64(5);
        let mask = find_homography(&kp_cur, &kp_ref, 0.2, 0.99, &mut rng).unwrap();
        assert!(mask.iter().all(|&m| m));
    }

    #[test]
    fn off_plane_points_are_excluded() {
        let k = Intrinsics::new(320.0, 240.0, 320.0, 320.0);
        let pose = Se3::new(Matrix3::identity(), Vector3::new(0.3, 0.0, 0.0));
        let mut kp_cur = Vec::new();
        let mut kp_ref = Vec::new();
        for i in 0..30 {
            let x = -1.5 + (i % 6) as f64 * 0.6;
            let y = -1.0 + (i / 6) as f64 * 0.5;
            // Final row sits well off the dominant plane.
            let z = if i >= 24 { 1.2 } else { 2.0 };
            let p = Vector3::new(x, y, z);
            let q = pose.transform(&p);
            kp_cur.push(Point2::new(k.fx * p.x / p.z + k.cx, k.fy * p.y / p.z + k.cy));
            kp_ref.push(Point2::new(k.fx * q.x / q.z + k.cx, k.fy * q.y / q.z + k.cy));
        }
        let mut rng = SmallRng::seed_from_u64(9);
        let mask = find_homography(&kp_cur, &kp_ref, 0.2, 0.99, &mut rng).unwrap();
        for (i, &m) in mask.iter().enumerate() {
            if i >= 24 {
                assert!(!m, "off-plane point {i} must not be a homography inlier");
            }
        }
        assert!(mask.iter().filter(|&&m| m).count() >= 20);
    }
}
