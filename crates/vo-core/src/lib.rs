//! vo-core: monocular visual odometry pipeline driven by dense optical
//! flow and depth predictions from external perception modules.

mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{Config, TrackingMethod};

pub mod frame;
pub use frame::FrameBuffer;

pub mod sampler;
pub use sampler::KeypointSampler;

pub mod consistency;
pub use consistency::DepthConsistency;

pub mod regression;

pub mod tracker;
pub use tracker::{EssTracker, PnpTracker, TrackerOutput, TrackingMode};

pub mod odometry;
pub use odometry::{FrameInput, VisualOdometry};

pub mod dataset;
pub use dataset::{ImageSequence, SequenceSource};

pub mod perception;
pub use perception::{PerceptionSource, PrecomputedPerception};

pub mod trajectory;

pub mod timer;
pub use timer::Timer;
