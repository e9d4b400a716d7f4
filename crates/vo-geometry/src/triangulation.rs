//! Linear two-view triangulation.

use nalgebra::{DMatrix, Matrix4, Point2, RowVector4, Vector3};

use crate::{DepthMap, Se3};

/// Triangulate matched normalized-coordinate keypoints seen from two views.
///
/// `t1` and `t2` map world coordinates into view-1 and view-2 frames
/// (the caller usually fixes `t1` to the identity so the world frame is
/// view 1). Returns the per-point 3D positions expressed in each view.
/// Points that cannot be resolved (rays meeting at infinity) come back at
/// the origin, where a zero depth marks them unusable downstream.
pub fn triangulate(
    kp1: &[Point2<f64>],
    kp2: &[Point2<f64>],
    t1: &Se3,
    t2: &Se3,
) -> (Vec<Vector3<f64>>, Vec<Vector3<f64>>) {
    let p1 = projection_rows(t1);
    let p2 = projection_rows(t2);
    let mut x1 = Vec::with_capacity(kp1.len());
    let mut x2 = Vec::with_capacity(kp1.len());
    for (a, b) in kp1.iter().zip(kp2.iter()) {
        let mut design = Matrix4::zeros();
        design.set_row(0, &(a.x * p1[2] - p1[0]));
        design.set_row(1, &(a.y * p1[2] - p1[1]));
        design.set_row(2, &(b.x * p2[2] - p2[0]));
        design.set_row(3, &(b.y * p2[2] - p2[1]));
        let point = match homogeneous_solution(&design) {
            Some(p) => p,
            None => Vector3::zeros(),
        };
        x1.push(t1.transform(&point));
        x2.push(t2.transform(&point));
    }
    (x1, x2)
}

/// Scatter triangulated view depths into a sparse depth image.
///
/// Each keypoint writes the Z of its 3D point at its (rounded) pixel;
/// negative depths are clamped to zero, out-of-bounds keypoints skipped.
pub fn scatter_depth(
    kps: &[Point2<f64>],
    points: &[Vector3<f64>],
    height: usize,
    width: usize,
) -> DepthMap {
    let mut depth = DMatrix::zeros(height, width);
    for (kp, point) in kps.iter().zip(points.iter()) {
        let col = kp.x.round();
        let row = kp.y.round();
        if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
            continue;
        }
        depth[(row as usize, col as usize)] = point.z.max(0.0) as f32;
    }
    depth
}

fn projection_rows(t: &Se3) -> [RowVector4<f64>; 3] {
    let m = t.to_matrix();
    [m.row(0).into_owned(), m.row(1).into_owned(), m.row(2).into_owned()]
}

/// Right null vector of the 4×4 design matrix, dehomogenized.
fn homogeneous_solution(design: &Matrix4<f64>) -> Option<Vector3<f64>> {
    let svd = design.svd(false, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);
    if h[3].abs() < 1e-12 {
        return None;
    }
    Some(Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]))
}
