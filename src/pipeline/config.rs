use serde::{Deserialize, Serialize};

use crate::error::{AugTestError, Result};

/// Order in which the upstream augmentation applied flip and resize.
///
/// The inverse mapping undoes the two steps in reverse order, so this must
/// mirror whatever the forward pipeline did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipOrder {
    /// Image resized first, then flipped about the resized width.
    FlipAfterResize,
    /// Image flipped about its original width, then resized.
    FlipBeforeResize,
}

/// Order of the two averaging passes when the mask head is cascaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskMergeOrder {
    StageThenView,
    ViewThenStage,
}

/// How per-view box predictions are fused before suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxMergeMode {
    /// Elementwise mean; every view must carry the same candidates in the same order.
    Average,
    /// Stack all views' rows and let suppression pick.
    Concatenate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpnTestConfig {
    pub nms_thr: f32,
    pub max_num: usize,
}

impl RpnTestConfig {
    pub fn new() -> Self {
        RpnTestConfig {
            nms_thr: 0.7,
            max_num: 1000,
        }
    }
}

impl Default for RpnTestConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RcnnTestConfig {
    pub score_thr: f32,
    pub iou_thr: f32,
    pub max_per_img: usize,
    pub mask_thr_binary: f32,
}

impl RcnnTestConfig {
    pub fn new() -> Self {
        RcnnTestConfig {
            score_thr: 0.05,
            iou_thr: 0.5,
            max_per_img: 100,
            mask_thr_binary: 0.5,
        }
    }
}

impl Default for RcnnTestConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugTestConfig {
    pub rpn: RpnTestConfig,
    pub rcnn: RcnnTestConfig,
    pub num_stages: usize,
    pub flip_order: FlipOrder,
    pub box_merge: BoxMergeMode,
    pub mask_merge_order: MaskMergeOrder,
    /// Per-view weights for mask averaging; `None` is a plain mean.
    pub mask_merge_weights: Option<Vec<f32>>,
}

impl AugTestConfig {
    pub fn new() -> Self {
        AugTestConfig {
            rpn: RpnTestConfig::new(),
            rcnn: RcnnTestConfig::new(),
            num_stages: 3,
            flip_order: FlipOrder::FlipAfterResize,
            box_merge: BoxMergeMode::Average,
            mask_merge_order: MaskMergeOrder::StageThenView,
            mask_merge_weights: None,
        }
    }

    /// validate checks the config against the number of cascade stage components.
    pub fn validate(&self, box_stages: usize, mask_stages: usize) -> Result<()> {
        if self.num_stages == 0 {
            return Err(AugTestError::InvalidConfig(
                "num_stages must be at least 1".to_string(),
            ));
        }
        if box_stages != self.num_stages {
            return Err(AugTestError::InvalidConfig(format!(
                "num_stages is {} but {} box stages were given",
                self.num_stages, box_stages
            )));
        }
        // a single mask head is allowed on top of a cascaded box branch
        if mask_stages != 0 && mask_stages != 1 && mask_stages != self.num_stages {
            return Err(AugTestError::InvalidConfig(format!(
                "num_stages is {} but {} mask stages were given",
                self.num_stages, mask_stages
            )));
        }
        if let Some(weights) = &self.mask_merge_weights {
            if weights.iter().any(|w| *w < 0.0) || weights.iter().sum::<f32>() <= 0.0 {
                return Err(AugTestError::InvalidConfig(
                    "mask_merge_weights must be non-negative with a positive sum".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for AugTestConfig {
    fn default() -> Self {
        Self::new()
    }
}
