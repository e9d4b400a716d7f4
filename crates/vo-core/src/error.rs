use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(&'static str),
    #[error("required data unavailable: {0}")]
    DataUnavailable(&'static str),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("geometry error: {0}")]
    Geometry(#[from] vo_geometry::Error),
    #[error("image error: {0}")]
    Image(String),
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}
