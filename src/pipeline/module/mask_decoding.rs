use ndarray::{s, Array2, Array4, ArrayView2};
use tracing::debug;

use crate::error::{AugTestError, Result};
use crate::pipeline::config::{AugTestConfig, MaskMergeOrder};
use crate::processing::merge::merge_aug_masks;
use crate::rcnn::bbox::{bbox2roi, map_to_view, scale_boxes};
use crate::rcnn::heads::{extract_roi_features, CascadeMaskStage, MaskHead, RegionFeatureTransform};
use crate::rcnn::meta::{AugView, Frame, ScaleFactor};
use crate::rcnn::result::{DetectionResult, SegmentationResult, ViewMaskProbs};
use crate::utils::utils::sigmoid_array;

/// Mask decoding stage: predicts instance masks on every view for the final
/// detections and pastes the merged maps into the original image.
pub struct MaskDecodingStage<'a> {
    stages: &'a [CascadeMaskStage],
    shared_head: &'a dyn RegionFeatureTransform,
}

impl<'a> MaskDecodingStage<'a> {
    /// new creates new MaskDecodingStage instance.
    pub fn new(stages: &'a [CascadeMaskStage], shared_head: &'a dyn RegionFeatureTransform) -> Self {
        MaskDecodingStage {
            stages,
            shared_head,
        }
    }

    fn last_head(&self) -> Result<&'a dyn MaskHead> {
        match self.stages.last() {
            Some(stage) => Ok(stage.mask_head.as_ref()),
            None => Err(AugTestError::InvalidConfig("no mask stages".to_string())),
        }
    }

    fn empty_result(&self) -> Result<SegmentationResult> {
        let num_fg = self.last_head()?.num_classes().saturating_sub(1);
        Ok(vec![Vec::new(); num_fg])
    }

    fn to_view_frame(
        view: AugView,
        boxes: ArrayView2<f32>,
        frame: Frame,
        cfg: &AugTestConfig,
    ) -> Result<Array2<f32>> {
        if boxes.ncols() < 4 {
            return Err(AugTestError::shape("mask box columns", 4, boxes.ncols()));
        }
        match frame {
            Frame::Original => map_to_view(boxes.slice(s![.., ..4]), view.meta, cfg.flip_order),
            Frame::View => Ok(boxes.slice(s![.., ..4]).to_owned()),
        }
    }

    /// decode_single_view predicts post-sigmoid mask maps with every stage.
    ///
    /// * `det_boxes` - n * 4 (or n * 5) boxes expressed in `frame`
    /// * `return` - one n * C * M * M map per stage, on the view's RoI grids;
    ///   no heads run when there are no boxes
    pub fn decode_single_view(
        &self,
        view: AugView,
        det_boxes: ArrayView2<f32>,
        frame: Frame,
        cfg: &AugTestConfig,
    ) -> Result<ViewMaskProbs> {
        if det_boxes.nrows() == 0 {
            let stages = self
                .stages
                .iter()
                .map(|stage| {
                    let head = stage.mask_head.as_ref();
                    let channels = if head.class_agnostic() { 1 } else { head.num_classes() };
                    Array4::zeros((0, channels, 0, 0))
                })
                .collect();
            return Ok(ViewMaskProbs {
                stages,
                meta: view.meta.clone(),
            });
        }
        let view_boxes = Self::to_view_frame(view, det_boxes, frame, cfg)?;
        let rois = bbox2roi(&[view_boxes.view()])?;
        let mut stages = Vec::with_capacity(self.stages.len());
        for stage in self.stages {
            let roi_feats =
                extract_roi_features(stage.roi_extractor.as_ref(), self.shared_head, view.features, &rois)?;
            let logits = stage.mask_head.forward(&roi_feats)?;
            if logits.shape()[0] != rois.nrows() {
                return Err(AugTestError::shape("mask head rows", rois.nrows(), logits.shape()[0]));
            }
            stages.push(sigmoid_array(logits));
        }
        Ok(ViewMaskProbs {
            stages,
            meta: view.meta.clone(),
        })
    }

    /// merge_views reduces views and stages to one n * C * M * M map.
    ///
    /// Flipped views are mirrored back on the RoI grid. View weights, when
    /// configured, apply to the view reduction only.
    pub fn merge_views(&self, views: &[ViewMaskProbs], cfg: &AugTestConfig) -> Result<Array4<f32>> {
        Self::merge(views, cfg.mask_merge_order, cfg.mask_merge_weights.as_deref())
    }

    fn merge(
        views: &[ViewMaskProbs],
        order: MaskMergeOrder,
        weights: Option<&[f32]>,
    ) -> Result<Array4<f32>> {
        let num_stages = match views.first() {
            Some(first) => first.stages.len(),
            None => return Err(AugTestError::InvalidConfig("no mask views to merge".to_string())),
        };
        for view in views {
            if view.stages.len() != num_stages {
                return Err(AugTestError::shape("mask stages per view", num_stages, view.stages.len()));
            }
        }

        match order {
            MaskMergeOrder::StageThenView => {
                let per_view = views
                    .iter()
                    .map(|v| {
                        let items: Vec<(&Array4<f32>, bool)> = v.stages.iter().map(|m| (m, false)).collect();
                        merge_aug_masks(&items, None)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let items: Vec<(&Array4<f32>, bool)> = per_view
                    .iter()
                    .zip(views.iter())
                    .map(|(m, v)| (m, v.meta.is_flipped))
                    .collect();
                merge_aug_masks(&items, weights)
            }
            MaskMergeOrder::ViewThenStage => {
                let per_stage = (0..num_stages)
                    .map(|stage| {
                        let items: Vec<(&Array4<f32>, bool)> = views
                            .iter()
                            .map(|v| (&v.stages[stage], v.meta.is_flipped))
                            .collect();
                        merge_aug_masks(&items, weights)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let items: Vec<(&Array4<f32>, bool)> = per_stage.iter().map(|m| (m, false)).collect();
                merge_aug_masks(&items, None)
            }
        }
    }

    /// decode_to_segmentation pastes merged maps at the original-frame boxes.
    pub fn decode_to_segmentation(
        &self,
        merged: &Array4<f32>,
        det: &DetectionResult,
        original_shape: (usize, usize),
        cfg: &AugTestConfig,
    ) -> Result<SegmentationResult> {
        Ok(self.last_head()?.get_seg_masks(
            merged.view(),
            det.boxes.view(),
            &det.labels,
            &cfg.rcnn,
            original_shape,
            ScaleFactor::Uniform(1.0),
            false,
        )?)
    }

    /// call decodes masks for original-frame detections over all views.
    pub fn call(
        &self,
        views: &[AugView],
        det: &DetectionResult,
        cfg: &AugTestConfig,
    ) -> Result<SegmentationResult> {
        if det.is_empty() {
            return self.empty_result();
        }
        let original_shape = match views.first() {
            Some(view) => view.meta.original_shape,
            None => return Err(AugTestError::InvalidConfig("no views".to_string())),
        };
        let mut per_view = Vec::with_capacity(views.len());
        for view in views {
            per_view.push(self.decode_single_view(*view, det.boxes.view(), Frame::Original, cfg)?);
        }
        let merged = self.merge_views(&per_view, cfg)?;
        debug!(views = views.len(), instances = det.len(), "merged masks");
        self.decode_to_segmentation(&merged, det, original_shape, cfg)
    }

    /// simple_test_mask decodes the detections of `simple_test_bboxes`.
    ///
    /// Those boxes never leave the view's orientation: with `rescale` they are
    /// only divided by the scale factor, so they are scaled back up here and the
    /// RoI grids are not mirrored even on a flipped view.
    pub fn simple_test_mask(
        &self,
        view: AugView,
        det: &DetectionResult,
        cfg: &AugTestConfig,
        rescale: bool,
    ) -> Result<SegmentationResult> {
        if det.is_empty() {
            return self.empty_result();
        }
        if det.boxes.ncols() < 4 {
            return Err(AugTestError::shape("mask box columns", 4, det.boxes.ncols()));
        }
        let boxes = det.boxes.slice(s![.., ..4]);
        let view_boxes = if rescale {
            scale_boxes(boxes, view.meta.scale_factor)?
        } else {
            boxes.to_owned()
        };
        let probs = self.decode_single_view(view, view_boxes.view(), Frame::View, cfg)?;
        let stages: Vec<(&Array4<f32>, bool)> = probs.stages.iter().map(|m| (m, false)).collect();
        let merged = merge_aug_masks(&stages, None)?;
        Ok(self.last_head()?.get_seg_masks(
            merged.view(),
            view_boxes.view(),
            &det.labels,
            &cfg.rcnn,
            view.meta.original_shape,
            view.meta.scale_factor,
            rescale,
        )?)
    }
}
