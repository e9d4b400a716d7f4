use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not enough correspondences: need {needed}, got {got}")]
    InsufficientCorrespondences { needed: usize, got: usize },
    #[error("degenerate geometry: {0}")]
    Degenerate(&'static str),
    #[error("rotation matrix failed the orthonormality check")]
    InvalidRotation,
    #[error("numerical failure: {0}")]
    Numerical(&'static str),
}
