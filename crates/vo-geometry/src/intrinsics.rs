use nalgebra::{Matrix3, Point2, Vector3};

/// Pinhole camera intrinsics at the processed image resolution.
///
/// Dataset adapters are responsible for rescaling to the processed
/// resolution before constructing this; the pipeline never rescales.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub cx: f64,
    pub cy: f64,
    pub fx: f64,
    pub fy: f64,
}

impl Intrinsics {
    pub fn new(cx: f64, cy: f64, fx: f64, fy: f64) -> Self {
        Self { cx, cy, fx, fy }
    }

    pub fn mat(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn inv_mat(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    /// Pixel coordinates to normalized camera coordinates.
    pub fn normalize(&self, p: &Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    /// Back-project a pixel to the ray point at depth `d`.
    pub fn unproject_pixel(&self, p: &Point2<f64>, d: f64) -> Vector3<f64> {
        let n = self.normalize(p);
        Vector3::new(n.x * d, n.y * d, d)
    }

    /// Project a camera-frame point; `None` when it is not in front.
    pub fn project_point(&self, x: &Vector3<f64>) -> Option<Point2<f64>> {
        if x.z <= 0.0 {
            return None;
        }
        Some(Point2::new(
            self.fx * x.x / x.z + self.cx,
            self.fy * x.y / x.z + self.cy,
        ))
    }
}
