//! Dense per-pixel operations on depth maps and point grids.

use nalgebra::{DMatrix, Vector3};

use crate::{Intrinsics, Se3};

/// Depth in metres; `0` marks a missing measurement.
pub type DepthMap = DMatrix<f32>;

/// Dense 2-channel displacement field on the anchor frame's pixel grid.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    pub u: DMatrix<f32>,
    pub v: DMatrix<f32>,
}

impl FlowField {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            u: DMatrix::zeros(height, width),
            v: DMatrix::zeros(height, width),
        }
    }

    pub fn height(&self) -> usize {
        self.u.nrows()
    }

    pub fn width(&self) -> usize {
        self.u.ncols()
    }

    /// Displacement at pixel `(row, col)`.
    pub fn at(&self, row: usize, col: usize) -> (f64, f64) {
        (self.u[(row, col)] as f64, self.v[(row, col)] as f64)
    }

    /// Matched position `(x, y)` in the other frame for pixel `(row, col)`.
    pub fn endpoint(&self, row: usize, col: usize) -> (f64, f64) {
        let (du, dv) = self.at(row, col);
        (col as f64 + du, row as f64 + dv)
    }
}

/// Per-pixel 3D points with validity flags, row-major.
#[derive(Debug, Clone)]
pub struct PointGrid {
    pub height: usize,
    pub width: usize,
    pub points: Vec<Vector3<f64>>,
    pub valid: Vec<bool>,
}

impl PointGrid {
    fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    pub fn at(&self, row: usize, col: usize) -> (&Vector3<f64>, bool) {
        let i = self.index(row, col);
        (&self.points[i], self.valid[i])
    }
}

/// Per-pixel projected image coordinates with validity flags.
#[derive(Debug, Clone)]
pub struct Projected {
    pub x: DMatrix<f64>,
    pub y: DMatrix<f64>,
    pub valid: DMatrix<bool>,
}

/// Back-project a depth map into camera-frame 3D points.
///
/// Pixels with zero depth are flagged invalid.
pub fn unproject(depth: &DepthMap, k: &Intrinsics) -> PointGrid {
    let (height, width) = depth.shape();
    let inv_k = k.inv_mat();
    let mut points = Vec::with_capacity(height * width);
    let mut valid = Vec::with_capacity(height * width);
    for row in 0..height {
        for col in 0..width {
            let d = depth[(row, col)] as f64;
            let ray = inv_k * Vector3::new(col as f64, row as f64, 1.0);
            points.push(ray * d);
            valid.push(d != 0.0);
        }
    }
    PointGrid {
        height,
        width,
        points,
        valid,
    }
}

/// Project a point grid into pixel coordinates.
///
/// Points behind the camera (`z ≤ 0`) or already invalid stay invalid.
pub fn project(grid: &PointGrid, k: &Intrinsics) -> Projected {
    let mut x = DMatrix::zeros(grid.height, grid.width);
    let mut y = DMatrix::zeros(grid.height, grid.width);
    let mut valid = DMatrix::from_element(grid.height, grid.width, false);
    for row in 0..grid.height {
        for col in 0..grid.width {
            let (p, ok) = grid.at(row, col);
            if !ok {
                continue;
            }
            if let Some(px) = k.project_point(p) {
                x[(row, col)] = px.x;
                y[(row, col)] = px.y;
                valid[(row, col)] = true;
            }
        }
    }
    Projected { x, y, valid }
}

/// Apply a rigid transform to every valid point of a grid.
pub fn transform_grid(grid: &PointGrid, t: &Se3) -> PointGrid {
    PointGrid {
        height: grid.height,
        width: grid.width,
        points: grid.points.iter().map(|p| t.transform(p)).collect(),
        valid: grid.valid.clone(),
    }
}

/// Apply a rigid transform to a point list.
pub fn transform_points(points: &[Vector3<f64>], t: &Se3) -> Vec<Vector3<f64>> {
    points.iter().map(|p| t.transform(p)).collect()
}

/// Synthesize the flow a rigid scene would induce.
///
/// `depth` belongs to the anchor frame and `pose` maps anchor-frame
/// coordinates into the other frame, so the result subtracts directly from
/// an observed flow anchored on the same frame.
pub fn rigid_flow(depth: &DepthMap, k: &Intrinsics, pose: &Se3) -> (FlowField, DMatrix<bool>) {
    let (height, width) = depth.shape();
    let warped = project(&transform_grid(&unproject(depth, k), pose), k);
    let mut flow = FlowField::zeros(height, width);
    for row in 0..height {
        for col in 0..width {
            if warped.valid[(row, col)] {
                flow.u[(row, col)] = (warped.x[(row, col)] - col as f64) as f32;
                flow.v[(row, col)] = (warped.y[(row, col)] - row as f64) as f32;
            }
        }
    }
    (flow, warped.valid)
}
