//! Essential-matrix estimation and relative-pose recovery.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::rngs::SmallRng;
use rand::seq::index;

use crate::{triangulation, Error, Intrinsics, Result, Se3};

const MIN_CORRESPONDENCES: usize = 8;
const MAX_RANSAC_ITERS: usize = 1000;
/// Triangulated points further than this (in baseline units) do not vote.
const MAX_CHEIRALITY_DEPTH: f64 = 50.0;

/// Estimate the Essential matrix with the normalized 8-point algorithm
/// inside a RANSAC loop scored by Sampson distance.
///
/// `kp_cur`/`kp_ref` are pixel coordinates; `reproj_thre` is the inlier
/// threshold in pixels and is divided by the focal length internally.
/// Returns the matrix satisfying `x_refᵀ · E · x_cur = 0` and the inlier
/// mask aligned with the input ordering.
pub fn find_essential(
    kp_cur: &[Point2<f64>],
    kp_ref: &[Point2<f64>],
    k: &Intrinsics,
    reproj_thre: f64,
    prob: f64,
    rng: &mut SmallRng,
) -> Result<(Matrix3<f64>, Vec<bool>)> {
    let n = kp_cur.len();
    if n < MIN_CORRESPONDENCES {
        return Err(Error::InsufficientCorrespondences {
            needed: MIN_CORRESPONDENCES,
            got: n,
        });
    }
    let x_cur: Vec<Point2<f64>> = kp_cur.iter().map(|p| k.normalize(p)).collect();
    let x_ref: Vec<Point2<f64>> = kp_ref.iter().map(|p| k.normalize(p)).collect();
    let thre = reproj_thre / k.fx;

    let mut best: Option<(Matrix3<f64>, usize, Vec<bool>)> = None;
    let mut max_iters = MAX_RANSAC_ITERS;
    let mut iter = 0;
    while iter < max_iters {
        iter += 1;
        let sample = index::sample(rng, n, MIN_CORRESPONDENCES);
        let e = match eight_point(sample.iter().map(|i| (&x_cur[i], &x_ref[i]))) {
            Some(e) => e,
            None => continue,
        };
        let (count, mask) = score_sampson(&e, &x_cur, &x_ref, thre);
        if count > best.as_ref().map_or(0, |b| b.1) {
            let ratio = count as f64 / n as f64;
            let miss = 1.0 - ratio.powi(MIN_CORRESPONDENCES as i32);
            best = Some((e, count, mask));
            if miss <= f64::EPSILON {
                break;
            }
            let needed = ((1.0 - prob).ln() / miss.ln()).ceil() as usize;
            max_iters = max_iters.min(needed.max(iter));
        }
    }

    let (coarse, count, mask) = best.ok_or(Error::Degenerate("essential ransac found no model"))?;
    if count < MIN_CORRESPONDENCES {
        return Err(Error::Degenerate("essential consensus set too small"));
    }
    // Least-squares re-fit on the consensus set.
    let refit = eight_point(
        mask.iter()
            .enumerate()
            .filter(|(_, m)| **m)
            .map(|(i, _)| (&x_cur[i], &x_ref[i])),
    );
    match refit {
        Some(e) => {
            let (_, mask) = score_sampson(&e, &x_cur, &x_ref, thre);
            Ok((e, mask))
        }
        None => Ok((coarse, mask)),
    }
}

/// Decompose an Essential matrix and pick the camera configuration with the
/// most points in front of both views.
///
/// Returns `(R, t̂, cheirality_count)` with `X_ref = R·X_cur + t̂` and
/// `‖t̂‖ = 1`.
pub fn recover_pose(
    e: &Matrix3<f64>,
    kp_cur: &[Point2<f64>],
    kp_ref: &[Point2<f64>],
    k: &Intrinsics,
) -> Result<(Matrix3<f64>, Vector3<f64>, usize)> {
    let x_cur: Vec<Point2<f64>> = kp_cur.iter().map(|p| k.normalize(p)).collect();
    let x_ref: Vec<Point2<f64>> = kp_ref.iter().map(|p| k.normalize(p)).collect();

    let svd = e.svd(true, true);
    let mut u = svd.u.ok_or(Error::Numerical("essential svd"))?;
    let mut v_t = svd.v_t.ok_or(Error::Numerical("essential svd"))?;
    if u.determinant() < 0.0 {
        u = -u;
    }
    if v_t.determinant() < 0.0 {
        v_t = -v_t;
    }
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
    let r1 = u * w * v_t;
    let r2 = u * w.transpose() * v_t;
    let t = u.column(2).into_owned();

    let mut best = (r1, t, 0usize);
    for (r, t) in [(r1, t), (r1, -t), (r2, t), (r2, -t)] {
        let count = cheirality_count(&r, &t, &x_cur, &x_ref);
        if count > best.2 {
            best = (r, t, count);
        }
    }
    Ok(best)
}

/// Points in front of both cameras under the candidate `(R, t)`.
fn cheirality_count(
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    x_cur: &[Point2<f64>],
    x_ref: &[Point2<f64>],
) -> usize {
    let view2 = Se3::new(*r, *t);
    let (p1, p2) = triangulation::triangulate(x_cur, x_ref, &Se3::identity(), &view2);
    p1.iter()
        .zip(p2.iter())
        .filter(|(a, b)| {
            a.z > 0.0 && b.z > 0.0 && a.z < MAX_CHEIRALITY_DEPTH && b.z < MAX_CHEIRALITY_DEPTH
        })
        .count()
}

/// Linear least-squares Essential estimate over normalized correspondences,
/// with the (1, 1, 0) singular-value structure enforced.
fn eight_point<'a>(
    pairs: impl Iterator<Item = (&'a Point2<f64>, &'a Point2<f64>)>,
) -> Option<Matrix3<f64>> {
    let mut m = SMatrix::<f64, 9, 9>::zeros();
    let mut count = 0;
    for (c, r) in pairs {
        let a = SVector::<f64, 9>::from_row_slice(&[
            r.x * c.x,
            r.x * c.y,
            r.x,
            r.y * c.x,
            r.y * c.y,
            r.y,
            c.x,
            c.y,
            1.0,
        ]);
        m += a * a.transpose();
        count += 1;
    }
    if count < MIN_CORRESPONDENCES {
        return None;
    }
    let e = smallest_eigenvector(&m)?;
    enforce_essential(&Matrix3::new(
        e[0], e[1], e[2], e[3], e[4], e[5], e[6], e[7], e[8],
    ))
}

fn smallest_eigenvector(m: &SMatrix<f64, 9, 9>) -> Option<SVector<f64, 9>> {
    let eig = SymmetricEigen::new(*m);
    let mut min_i = 0;
    for i in 1..9 {
        if eig.eigenvalues[i] < eig.eigenvalues[min_i] {
            min_i = i;
        }
    }
    let v = eig.eigenvectors.column(min_i).into_owned();
    if v.iter().all(|x| x.is_finite()) {
        Some(v)
    } else {
        None
    }
}

fn enforce_essential(e: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    let svd = e.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let sigma = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 0.0));
    Some(u * sigma * v_t)
}

fn score_sampson(
    e: &Matrix3<f64>,
    x_cur: &[Point2<f64>],
    x_ref: &[Point2<f64>],
    thre: f64,
) -> (usize, Vec<bool>) {
    let thre_sq = thre * thre;
    let et = e.transpose();
    let mut mask = Vec::with_capacity(x_cur.len());
    let mut count = 0;
    for (c, r) in x_cur.iter().zip(x_ref.iter()) {
        let xc = Vector3::new(c.x, c.y, 1.0);
        let xr = Vector3::new(r.x, r.y, 1.0);
        let e_xc = e * xc;
        let et_xr = et * xr;
        let residual = xr.dot(&e_xc);
        let denom = e_xc.x * e_xc.x + e_xc.y * e_xc.y + et_xr.x * et_xr.x + et_xr.y * et_xr.y;
        let inlier = denom > 0.0 && residual * residual / denom < thre_sq;
        mask.push(inlier);
        count += inlier as usize;
    }
    (count, mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;
    use rand::SeedableRng;

    fn camera() -> Intrinsics {
        Intrinsics::new(320.0, 240.0, 320.0, 320.0)
    }

    fn scene_points() -> Vec<Vector3<f64>> {
        let mut points = Vec::new();
        for i in 0..60 {
            let x = -2.0 + (i % 10) as f64 * 0.45;
            let y = -1.5 + (i / 10) as f64 * 0.55;
            let z = 4.0 + ((i * 37) % 11) as f64 * 0.3;
            points.push(Vector3::new(x, y, z));
        }
        points
    }

    fn render(points: &[Vector3<f64>], pose: &Se3, k: &Intrinsics) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| {
                let q = pose.transform(p);
                Point2::new(k.fx * q.x / q.z + k.cx, k.fy * q.y / q.z + k.cy)
            })
            .collect()
    }

    #[test]
    fn recovers_known_relative_pose() {
        let k = camera();
        let points = scene_points();
        let truth = Se3::new(
            Rotation3::from_euler_angles(0.01, 0.05, -0.02).into_inner(),
            Vector3::new(0.3, 0.05, 0.1),
        );
        let kp_cur = render(&points, &Se3::identity(), &k);
        let kp_ref = render(&points, &truth, &k);
        let mut rng = SmallRng::seed_from_u64(7);

        let (e, inliers) = find_essential(&kp_cur, &kp_ref, &k, 1.0, 0.99, &mut rng).unwrap();
        assert!(inliers.iter().all(|&m| m));

        let (r, t, count) = recover_pose(&e, &kp_cur, &kp_ref, &k).unwrap();
        assert_eq!(count, points.len());
        assert!((r - truth.r).norm() < 1e-4);
        let dir = truth.t / truth.t.norm();
        assert!((t - dir).norm() < 1e-4);
    }

    #[test]
    fn outliers_are_masked_out() {
        let k = camera();
        let points = scene_points();
        let truth = Se3::new(Matrix3::identity(), Vector3::new(0.4, 0.0, 0.0));
        let kp_cur = render(&points, &Se3::identity(), &k);
        let mut kp_ref = render(&points, &truth, &k);
        for i in 0..6 {
            kp_ref[i * 9].x += 25.0;
            kp_ref[i * 9].y -= 13.0;
        }
        let mut rng = SmallRng::seed_from_u64(11);
        let (_, inliers) = find_essential(&kp_cur, &kp_ref, &k, 1.0, 0.99, &mut rng).unwrap();
        for i in 0..6 {
            assert!(!inliers[i * 9]);
        }
        assert!(inliers.iter().filter(|&&m| m).count() >= points.len() - 6);
    }

    #[test]
    fn pure_rotation_fails_cheirality() {
        let k = camera();
        let points = scene_points();
        let truth = Se3::new(
            Rotation3::from_euler_angles(0.0, 0.1, 0.02).into_inner(),
            Vector3::zeros(),
        );
        let kp_cur = render(&points, &Se3::identity(), &k);
        let kp_ref = render(&points, &truth, &k);
        let mut rng = SmallRng::seed_from_u64(3);
        if let Ok((e, _)) = find_essential(&kp_cur, &kp_ref, &k, 1.0, 0.99, &mut rng) {
            let (_, _, count) = recover_pose(&e, &kp_cur, &kp_ref, &k).unwrap();
            assert!(count < points.len() / 5);
        }
    }

    #[test]
    fn too_few_correspondences_is_an_error() {
        let k = camera();
        let kp: Vec<Point2<f64>> = (0..5).map(|i| Point2::new(i as f64, 0.0)).collect();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(find_essential(&kp, &kp, &k, 1.0, 0.99, &mut rng).is_err());
    }
}
