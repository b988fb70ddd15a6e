//! Interfaces of the network components the test-time logic drives.
//!
//! Everything here is a numerical black box: implementations wrap whatever
//! inference backend produced the weights. Heads report failures through
//! `anyhow`, the orchestration lifts them into [`AugTestError`].
//!
//! [`AugTestError`]: crate::error::AugTestError

use anyhow::Result;
use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4};

use crate::pipeline::config::{RcnnTestConfig, RpnTestConfig};
use crate::processing::bbox_regression::{self, BoxCoder};
use crate::processing::mask::{self, SegMaskParams};
use crate::processing::nms::multiclass_nms;
use crate::rcnn::bbox::roi_boxes;
use crate::rcnn::meta::{ImageViewMeta, ScaleFactor};
use crate::rcnn::result::{DetectionResult, SegmentationResult};

/// Region proposal head plus its box decoding, for one view.
pub trait RpnHead {
    /// Returns n * 5 `(x1, y1, x2, y2, objectness)` rows in the view's frame.
    fn get_proposals(
        &self,
        features: &[Array4<f32>],
        meta: &ImageViewMeta,
        cfg: &RpnTestConfig,
    ) -> Result<Array2<f32>>;
}

/// Crops fixed-size features for `[batch_idx, x1, y1, x2, y2]` RoIs.
pub trait RoiExtractor {
    /// One stride per pyramid level this extractor reads.
    fn featmap_strides(&self) -> &[usize];

    fn extract(&self, features: &[Array4<f32>], rois: &Array2<f32>) -> Result<Array4<f32>>;
}

/// Optional shared neck between the RoI extractor and the heads.
pub trait RegionFeatureTransform {
    fn transform(&self, roi_feats: Array4<f32>) -> Result<Array4<f32>>;

    fn is_identity(&self) -> bool {
        false
    }
}

/// Pass-through neck, used when the model has no shared head.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl RegionFeatureTransform for IdentityTransform {
    fn transform(&self, roi_feats: Array4<f32>) -> Result<Array4<f32>> {
        Ok(roi_feats)
    }

    fn is_identity(&self) -> bool {
        true
    }
}

/// Classification and box regression head of one cascade stage.
pub trait BBoxHead {
    /// Including background.
    fn num_classes(&self) -> usize;

    /// Returns `(cls_score, bbox_pred)`: n * num_classes logits and n * 4 or
    /// n * (4 * num_classes) normalized deltas.
    fn forward(&self, roi_feats: &Array4<f32>) -> Result<(Array2<f32>, Array2<f32>)>;

    fn reg_class_agnostic(&self) -> bool {
        false
    }

    fn box_coder(&self) -> BoxCoder {
        BoxCoder::default()
    }

    /// get_bboxes turns stage outputs into boxes and class probabilities.
    ///
    /// Boxes are clipped to `img_shape` and divided by `scale_factor` when
    /// `rescale` is set. Returns `(bboxes, scores)` with one row per RoI.
    fn get_bboxes(
        &self,
        rois: &Array2<f32>,
        cls_score: ArrayView2<f32>,
        bbox_pred: ArrayView2<f32>,
        img_shape: (usize, usize),
        scale_factor: ScaleFactor,
        rescale: bool,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        let scores = bbox_regression::softmax_rows(cls_score);
        let mut bboxes = self.box_coder().decode(roi_boxes(rois), bbox_pred, Some(img_shape))?;
        if rescale {
            let factors = scale_factor.as_box();
            for mut row in bboxes.outer_iter_mut() {
                for (i, v) in row.iter_mut().enumerate() {
                    *v /= factors[i % 4];
                }
            }
        }
        Ok((bboxes, scores))
    }

    /// get_det_bboxes is [`BBoxHead::get_bboxes`] followed by class-wise suppression.
    #[allow(clippy::too_many_arguments)]
    fn get_det_bboxes(
        &self,
        rois: &Array2<f32>,
        cls_score: ArrayView2<f32>,
        bbox_pred: ArrayView2<f32>,
        img_shape: (usize, usize),
        scale_factor: ScaleFactor,
        rescale: bool,
        cfg: &RcnnTestConfig,
    ) -> Result<DetectionResult> {
        let (bboxes, scores) =
            self.get_bboxes(rois, cls_score, bbox_pred, img_shape, scale_factor, rescale)?;
        Ok(multiclass_nms(
            bboxes.view(),
            scores.view(),
            cfg.score_thr,
            cfg.iou_thr,
            cfg.max_per_img,
        )?)
    }

    /// regress_by_class refines RoIs with the deltas of each RoI's label.
    fn regress_by_class(
        &self,
        rois: &Array2<f32>,
        labels: &Array1<usize>,
        bbox_pred: ArrayView2<f32>,
        img_shape: (usize, usize),
    ) -> Result<Array2<f32>> {
        Ok(bbox_regression::regress_by_class(
            &self.box_coder(),
            rois,
            labels,
            bbox_pred,
            self.reg_class_agnostic(),
            img_shape,
        )?)
    }
}

/// Mask prediction head of one cascade stage.
pub trait MaskHead {
    /// Including background.
    fn num_classes(&self) -> usize;

    /// Returns n * C * M * M mask logits, C = 1 when class agnostic.
    fn forward(&self, roi_feats: &Array4<f32>) -> Result<Array4<f32>>;

    fn class_agnostic(&self) -> bool {
        false
    }

    /// get_seg_masks decodes probabilities into per-class binary masks.
    #[allow(clippy::too_many_arguments)]
    fn get_seg_masks(
        &self,
        mask_probs: ArrayView4<f32>,
        det_bboxes: ArrayView2<f32>,
        det_labels: &Array1<usize>,
        cfg: &RcnnTestConfig,
        ori_shape: (usize, usize),
        scale_factor: ScaleFactor,
        rescale: bool,
    ) -> Result<SegmentationResult> {
        let params = SegMaskParams {
            num_classes: self.num_classes(),
            class_agnostic: self.class_agnostic(),
            mask_thr_binary: cfg.mask_thr_binary,
        };
        Ok(mask::get_seg_masks(
            mask_probs,
            det_bboxes,
            det_labels,
            params,
            ori_shape,
            scale_factor,
            rescale,
        )?)
    }
}

/// One box stage of the cascade: its own extractor and head.
pub struct CascadeBoxStage {
    pub roi_extractor: Box<dyn RoiExtractor>,
    pub bbox_head: Box<dyn BBoxHead>,
}

/// One mask stage of the cascade: its own extractor and head.
pub struct CascadeMaskStage {
    pub roi_extractor: Box<dyn RoiExtractor>,
    pub mask_head: Box<dyn MaskHead>,
}

/// Runs an extractor on the pyramid levels it was built for, then the neck.
pub fn extract_roi_features(
    roi_extractor: &dyn RoiExtractor,
    shared_head: &dyn RegionFeatureTransform,
    features: &[Array4<f32>],
    rois: &Array2<f32>,
) -> Result<Array4<f32>> {
    let levels = roi_extractor.featmap_strides().len().min(features.len());
    let roi_feats = roi_extractor.extract(&features[..levels], rois)?;
    if shared_head.is_identity() {
        Ok(roi_feats)
    } else {
        shared_head.transform(roi_feats)
    }
}
