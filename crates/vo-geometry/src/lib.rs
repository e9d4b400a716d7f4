//! vo-geometry: camera geometry primitives for monocular visual odometry

mod error;
pub use error::{Error, Result};

mod se3;
pub use se3::Se3;

mod intrinsics;
pub use intrinsics::Intrinsics;

pub mod ops;
pub use ops::{DepthMap, FlowField, PointGrid, Projected};

pub mod triangulation;

pub mod epipolar;

pub mod homography;

pub mod pnp;
