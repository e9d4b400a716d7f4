use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::{Error, Result};

/// Tolerance for `R·Rᵀ = I` when a rotation comes out of a decomposition.
const ORTHONORMAL_TOL: f64 = 1e-6;

/// Rigid transform `x' = R·x + t`.
///
/// Relative poses throughout the pipeline map current-frame coordinates
/// into reference-frame coordinates; global poses map frame coordinates
/// into the world frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Se3 {
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
}

impl Default for Se3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Se3 {
    pub fn identity() -> Self {
        Self {
            r: Matrix3::identity(),
            t: Vector3::zeros(),
        }
    }

    pub fn new(r: Matrix3<f64>, t: Vector3<f64>) -> Self {
        Self { r, t }
    }

    /// Build from a rotation produced by a matrix decomposition, rejecting
    /// results that drifted off the SO(3) manifold.
    pub fn from_decomposition(r: Matrix3<f64>, t: Vector3<f64>) -> Result<Self> {
        let residual = (r * r.transpose() - Matrix3::identity()).norm();
        let det = r.determinant();
        if residual > ORTHONORMAL_TOL || !(0.99..1.01).contains(&det) {
            return Err(Error::InvalidRotation);
        }
        Ok(Self { r, t })
    }

    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        Self {
            r: m.fixed_view::<3, 3>(0, 0).into_owned(),
            t: m.fixed_view::<3, 1>(0, 3).into_owned(),
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.r);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.t);
        m
    }

    pub fn inv(&self) -> Self {
        let rt = self.r.transpose();
        Self {
            r: rt,
            t: -(rt * self.t),
        }
    }

    /// `self ∘ rhs`: apply `rhs` first, then `self`.
    pub fn compose(&self, rhs: &Se3) -> Se3 {
        Se3 {
            r: self.r * rhs.r,
            t: self.r * rhs.t + self.t,
        }
    }

    pub fn transform(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.r * p + self.t
    }

    pub fn is_identity(&self) -> bool {
        self.r == Matrix3::identity() && self.t == Vector3::zeros()
    }
}

impl std::ops::Mul<&Se3> for &Se3 {
    type Output = Se3;

    fn mul(self, rhs: &Se3) -> Se3 {
        self.compose(rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_identity() {
        let id = Se3::default();
        assert_eq!(id.r, Matrix3::identity());
        assert_eq!(id.t, Vector3::zeros());
        assert!(id.is_identity());
    }

    #[test]
    fn inverse_composes_to_identity() {
        let r = nalgebra::Rotation3::from_euler_angles(0.1, -0.2, 0.3);
        let pose = Se3::new(r.into_inner(), Vector3::new(1.0, -2.0, 0.5));
        let round = pose.compose(&pose.inv());
        assert!((round.r - Matrix3::identity()).norm() < 1e-12);
        assert!(round.t.norm() < 1e-12);
    }

    #[test]
    fn matrix_round_trip() {
        let r = nalgebra::Rotation3::from_euler_angles(-0.3, 0.05, 0.7);
        let pose = Se3::new(r.into_inner(), Vector3::new(0.1, 0.2, 0.3));
        let back = Se3::from_matrix(&pose.to_matrix());
        assert!((back.r - pose.r).norm() < 1e-15);
        assert!((back.t - pose.t).norm() < 1e-15);
    }

    #[test]
    fn transform_matches_matrix_product() {
        let r = nalgebra::Rotation3::from_euler_angles(0.0, 0.4, 0.0);
        let pose = Se3::new(r.into_inner(), Vector3::new(0.0, 1.0, 0.0));
        let p = Vector3::new(2.0, 0.0, 5.0);
        let expected = (pose.to_matrix() * p.push(1.0)).xyz();
        assert!((pose.transform(&p) - expected).norm() < 1e-12);
    }

    #[test]
    fn decomposition_rejects_skewed_rotation() {
        let mut r = Matrix3::identity();
        r[(0, 1)] = 0.1;
        assert!(Se3::from_decomposition(r, Vector3::zeros()).is_err());
    }
}
