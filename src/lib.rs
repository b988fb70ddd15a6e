//! Test-time augmentation for cascade region-based detectors.
//!
//! Runs a cascade R-CNN style model over several augmented views of one image
//! (rescaled, horizontally flipped) and fuses proposals, detections and
//! instance masks back into the original image frame.

pub mod error;
pub mod pipeline;
pub mod processing;
pub mod rcnn;
mod utils;

pub use error::{AugTestError, Result};
pub use pipeline::cascade_pipeline::{CascadeTestPipeline, PipelineOutput};
pub use pipeline::config::{AugTestConfig, BoxMergeMode, FlipOrder, MaskMergeOrder, RcnnTestConfig, RpnTestConfig};
pub use rcnn::meta::{AugView, Frame, ImageViewMeta, ScaleFactor};
pub use rcnn::result::{DetectionResult, SegmentationResult};
