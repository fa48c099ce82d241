//! Core crate for neuronflow: tiled sliding-window segmentation inference.

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod model;
pub mod preprocess;
pub mod runtime;

pub use engine::{InferenceConfig, InferenceProgress, SlidingWindowInferer};
pub use error::InferenceError;
pub use model::SegmentationModel;
