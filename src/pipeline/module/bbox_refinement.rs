use ndarray::{s, Array2, ArrayView2, Array4};
use tracing::{debug, trace};

use crate::error::{AugTestError, Result};
use crate::pipeline::config::AugTestConfig;
use crate::processing::bbox_regression::argmax_rows;
use crate::processing::merge::merge_aug_bboxes;
use crate::processing::nms::multiclass_nms;
use crate::rcnn::bbox::{bbox2roi, map_to_original, map_to_view};
use crate::rcnn::heads::{extract_roi_features, CascadeBoxStage, RegionFeatureTransform};
use crate::rcnn::meta::{AugView, Frame, ImageViewMeta};
use crate::rcnn::result::{DetectionResult, ViewDetections};

/// Running state of the cascade over one view.
#[derive(Debug, Clone)]
pub struct StageState {
    /// RoIs fed to the next stage, `[batch_idx, x1, y1, x2, y2]`.
    pub rois: Array2<f32>,
    pub score_sum: Option<Array2<f32>>,
    /// Deltas of the most recent stage.
    pub bbox_pred: Option<Array2<f32>>,
    pub stages_seen: usize,
}

impl StageState {
    pub fn new(rois: Array2<f32>) -> Self {
        StageState {
            rois,
            score_sum: None,
            bbox_pred: None,
            stages_seen: 0,
        }
    }

    /// accumulate adds one stage's outputs. With `refined` the RoIs for the
    /// next stage replace the current ones.
    pub fn accumulate(
        self,
        cls_score: Array2<f32>,
        bbox_pred: Array2<f32>,
        refined: Option<Array2<f32>>,
    ) -> Result<Self> {
        if cls_score.nrows() != self.rois.nrows() {
            return Err(AugTestError::shape("stage score rows", self.rois.nrows(), cls_score.nrows()));
        }
        let score_sum = match self.score_sum {
            None => cls_score,
            Some(sum) => {
                if sum.dim() != cls_score.dim() {
                    return Err(AugTestError::shape("stage score columns", sum.ncols(), cls_score.ncols()));
                }
                sum + &cls_score
            }
        };
        Ok(StageState {
            rois: refined.unwrap_or(self.rois),
            score_sum: Some(score_sum),
            bbox_pred: Some(bbox_pred),
            stages_seen: self.stages_seen + 1,
        })
    }

    /// Mean of the accumulated class logits.
    pub fn mean_score(&self) -> Option<Array2<f32>> {
        self.score_sum
            .as_ref()
            .map(|sum| sum / self.stages_seen as f32)
    }
}

/// Box refinement stage: runs the cascade on each view, fuses the views and
/// suppresses per class.
pub struct BoxRefinementStage<'a> {
    stages: &'a [CascadeBoxStage],
    shared_head: &'a dyn RegionFeatureTransform,
}

impl<'a> BoxRefinementStage<'a> {
    /// new creates new BoxRefinementStage instance.
    pub fn new(stages: &'a [CascadeBoxStage], shared_head: &'a dyn RegionFeatureTransform) -> Self {
        BoxRefinementStage {
            stages,
            shared_head,
        }
    }

    fn last_stage(&self) -> Result<&'a CascadeBoxStage> {
        match self.stages.last() {
            Some(stage) => Ok(stage),
            None => Err(AugTestError::InvalidConfig("no box stages".to_string())),
        }
    }

    /// run_cascade folds the stages over `rois`, refining them between stages.
    pub fn run_cascade(
        &self,
        features: &[Array4<f32>],
        rois: Array2<f32>,
        img_shape: (usize, usize),
    ) -> Result<StageState> {
        let num_stages = self.stages.len();
        self.stages
            .iter()
            .enumerate()
            .try_fold(StageState::new(rois), |state, (i, stage)| {
                let roi_feats =
                    extract_roi_features(stage.roi_extractor.as_ref(), self.shared_head, features, &state.rois)?;
                let (cls_score, bbox_pred) = stage.bbox_head.forward(&roi_feats)?;
                let refined = if i + 1 < num_stages {
                    let labels = argmax_rows(cls_score.view());
                    Some(stage.bbox_head.regress_by_class(
                        &state.rois,
                        &labels,
                        bbox_pred.view(),
                        img_shape,
                    )?)
                } else {
                    None
                };
                trace!(stage = i, rois = state.rois.nrows(), "cascade stage");
                state.accumulate(cls_score, bbox_pred, refined)
            })
    }

    fn empty_view(&self, view: AugView) -> Result<ViewDetections> {
        let head = &self.last_stage()?.bbox_head;
        let num_classes = head.num_classes();
        let box_cols = if head.reg_class_agnostic() { 4 } else { 4 * num_classes };
        Ok(ViewDetections {
            boxes: Array2::zeros((0, box_cols)),
            scores: Array2::zeros((0, num_classes)),
            meta: view.meta.clone(),
        })
    }

    fn view_rois(&self, view: AugView, candidates: ArrayView2<f32>, frame: Frame, cfg: &AugTestConfig) -> Result<Array2<f32>> {
        if candidates.ncols() < 4 {
            return Err(AugTestError::shape("candidate columns", 4, candidates.ncols()));
        }
        let boxes = candidates.slice(s![.., ..4]);
        let view_boxes = match frame {
            Frame::Original => map_to_view(boxes, view.meta, cfg.flip_order)?,
            Frame::View => boxes.to_owned(),
        };
        bbox2roi(&[view_boxes.view()])
    }

    /// refine_single_view runs all stages on one view's candidates.
    ///
    /// * `candidates` - n * 4 (or n * 5) boxes expressed in `frame`
    /// * `rescale` - map the output boxes back to the original image
    /// * `return` - raw `(boxes, scores)` in the view's frame, or in the original
    ///   frame under an identity meta when rescaled
    pub fn refine_single_view(
        &self,
        view: AugView,
        candidates: ArrayView2<f32>,
        frame: Frame,
        cfg: &AugTestConfig,
        rescale: bool,
    ) -> Result<ViewDetections> {
        if candidates.nrows() == 0 {
            return self.empty_view(view);
        }
        let rois = self.view_rois(view, candidates, frame, cfg)?;
        let state = self.run_cascade(view.features, rois, view.meta.view_shape)?;
        let (cls_score, bbox_pred) = match (state.mean_score(), state.bbox_pred.as_ref()) {
            (Some(score), Some(pred)) => (score, pred),
            _ => return Err(AugTestError::InvalidConfig("no box stages".to_string())),
        };
        let (boxes, scores) = self.last_stage()?.bbox_head.get_bboxes(
            &state.rois,
            cls_score.view(),
            bbox_pred.view(),
            view.meta.view_shape,
            view.meta.scale_factor,
            false,
        )?;
        if rescale {
            return Ok(ViewDetections {
                boxes: map_to_original(boxes.view(), view.meta, cfg.flip_order)?,
                scores,
                meta: ImageViewMeta::identity(view.meta.original_shape),
            });
        }
        Ok(ViewDetections {
            boxes,
            scores,
            meta: view.meta.clone(),
        })
    }

    /// merge_views_and_suppress fuses per-view outputs in the original frame
    /// and keeps at most `rcnn.max_per_img` detections.
    pub fn merge_views_and_suppress(
        &self,
        views: &[ViewDetections],
        cfg: &AugTestConfig,
    ) -> Result<DetectionResult> {
        if views.iter().all(|v| v.boxes.nrows() == 0) {
            return Ok(DetectionResult::empty());
        }
        let (boxes, scores) = merge_aug_bboxes(views, cfg.box_merge, cfg.flip_order)?;
        let det = multiclass_nms(
            boxes.view(),
            scores.view(),
            cfg.rcnn.score_thr,
            cfg.rcnn.iou_thr,
            cfg.rcnn.max_per_img,
        )?;
        debug!(views = views.len(), candidates = boxes.nrows(), kept = det.len(), "merged detections");
        Ok(det)
    }

    /// call refines merged proposals (original frame) on every view.
    pub fn call(
        &self,
        views: &[AugView],
        proposals: ArrayView2<f32>,
        cfg: &AugTestConfig,
    ) -> Result<DetectionResult> {
        if proposals.nrows() == 0 {
            return Ok(DetectionResult::empty());
        }
        let mut per_view = Vec::with_capacity(views.len());
        for view in views {
            per_view.push(self.refine_single_view(*view, proposals, Frame::Original, cfg, false)?);
        }
        self.merge_views_and_suppress(&per_view, cfg)
    }

    /// simple_test_bboxes refines one view's own proposals and suppresses.
    pub fn simple_test_bboxes(
        &self,
        view: AugView,
        proposals: ArrayView2<f32>,
        cfg: &AugTestConfig,
        rescale: bool,
    ) -> Result<DetectionResult> {
        if proposals.nrows() == 0 {
            return Ok(DetectionResult::empty());
        }
        let rois = self.view_rois(view, proposals, Frame::View, cfg)?;
        let state = self.run_cascade(view.features, rois, view.meta.view_shape)?;
        let (cls_score, bbox_pred) = match (state.mean_score(), state.bbox_pred.as_ref()) {
            (Some(score), Some(pred)) => (score, pred),
            _ => return Err(AugTestError::InvalidConfig("no box stages".to_string())),
        };
        Ok(self.last_stage()?.bbox_head.get_det_bboxes(
            &state.rois,
            cls_score.view(),
            bbox_pred.view(),
            view.meta.view_shape,
            view.meta.scale_factor,
            rescale,
            &cfg.rcnn,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array1, Array2};

    use crate::pipeline::config::AugTestConfig;
    use crate::pipeline::module::bbox_refinement::{BoxRefinementStage, StageState};
    use crate::rcnn::heads::IdentityTransform;
    use crate::rcnn::meta::{AugView, Frame, ImageViewMeta, ScaleFactor};
    use crate::rcnn::testing::{box_stages, features};

    fn three_stage_logits() -> Vec<Array1<f32>> {
        vec![
            array![0.2, 0.5, 0.3],
            array![0.4, 0.3, 0.3],
            array![0.5, 0.3, 0.2],
        ]
    }

    #[test]
    fn test_stage_scores_average() {
        let mut state = StageState::new(array![[0.0, 0.0, 0.0, 9.0, 9.0]]);
        for logits in three_stage_logits() {
            let scores = logits.insert_axis(ndarray::Axis(0));
            state = state.accumulate(scores, Array2::zeros((1, 12)), None).unwrap();
        }
        let mean = state.mean_score().unwrap();
        let expected = [0.3667, 0.3667, 0.2667];
        for (got, want) in mean.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4);
        }
        assert_eq!(state.stages_seen, 3);
    }

    #[test]
    fn test_cascade_mean_through_heads() {
        let (stages, calls) = box_stages(&three_stage_logits());
        let neck = IdentityTransform;
        let stage = BoxRefinementStage::new(&stages, &neck);
        let feats = features();
        let state = stage
            .run_cascade(&feats, array![[0.0, 10.0, 10.0, 30.0, 30.0]], (60, 80))
            .unwrap();
        let mean = state.mean_score().unwrap();
        assert!((mean[(0, 0)] - 1.1 / 3.0).abs() < 1e-5);
        assert!((mean[(0, 2)] - 0.8 / 3.0).abs() < 1e-5);
        // zero deltas leave the RoIs in place between stages
        assert_eq!(state.rois, array![[0.0, 10.0, 10.0, 30.0, 30.0]]);
        assert!(calls.iter().all(|c| c.get() == 1));
    }

    #[test]
    fn test_refine_flipped_view_maps_candidates() {
        let (stages, _) = box_stages(&three_stage_logits());
        let neck = IdentityTransform;
        let stage = BoxRefinementStage::new(&stages, &neck);
        let feats = features();
        let meta = ImageViewMeta::identity((60, 80)).flipped();
        let cfg = AugTestConfig::new();
        let out = stage
            .refine_single_view(
                AugView::new(&feats, &meta),
                array![[10.0, 10.0, 30.0, 30.0]].view(),
                Frame::Original,
                &cfg,
                false,
            )
            .unwrap();
        assert_eq!(out.boxes.dim(), (1, 12));
        assert_eq!(out.scores.dim(), (1, 3));
        // boxes stay in the flipped view's frame
        assert!((out.boxes[(0, 4)] - 49.0).abs() < 1e-4);
        assert!((out.boxes[(0, 6)] - 69.0).abs() < 1e-4);
        let row_sum: f32 = out.scores.row(0).sum();
        assert!((row_sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_rescaled_view_merges_once() {
        let (stages, _) = box_stages(&three_stage_logits());
        let neck = IdentityTransform;
        let stage = BoxRefinementStage::new(&stages, &neck);
        let feats = features();
        let meta = ImageViewMeta::new((60, 80), (120, 160), ScaleFactor::Uniform(2.0), true);
        let cfg = AugTestConfig::new();
        let out = stage
            .refine_single_view(
                AugView::new(&feats, &meta),
                array![[10.0, 10.0, 30.0, 30.0]].view(),
                Frame::Original,
                &cfg,
                true,
            )
            .unwrap();
        assert_eq!(out.meta, ImageViewMeta::identity((60, 80)));
        for group in out.boxes.row(0).to_vec().chunks(4) {
            assert!(group.iter().zip([10.0, 10.0, 30.0, 30.0].iter()).all(|(g, w)| (g - w).abs() < 1e-3));
        }

        // merging leaves original-frame boxes untouched
        let det = stage.merge_views_and_suppress(&[out], &cfg).unwrap();
        assert!(!det.is_empty());
        for row in det.boxes.outer_iter() {
            assert!((row[0] - 10.0).abs() < 1e-3);
            assert!((row[2] - 30.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_merge_views_and_suppress() {
        let (stages, _) = box_stages(&[array![0.0, 3.0, 0.0]]);
        let neck = IdentityTransform;
        let stage = BoxRefinementStage::new(&stages, &neck);
        let feats = features();
        let plain = ImageViewMeta::new((60, 80), (120, 160), ScaleFactor::Uniform(2.0), false);
        let flipped = plain.flipped();
        let views = [AugView::new(&feats, &plain), AugView::new(&feats, &flipped)];
        let cfg = AugTestConfig::new();
        let proposals = array![[10.0, 10.0, 30.0, 30.0, 0.9], [12.0, 10.0, 32.0, 30.0, 0.8]];

        let det = stage.call(&views, proposals.view(), &cfg).unwrap();
        // overlapping boxes of the same class collapse to one
        assert_eq!(det.len(), 1);
        assert_eq!(det.labels.to_vec(), vec![0]);
        assert!((det.boxes[(0, 0)] - 10.0).abs() < 1e-3);
        assert!((det.boxes[(0, 2)] - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_no_candidates_skip_heads() {
        let (stages, calls) = box_stages(&three_stage_logits());
        let neck = IdentityTransform;
        let stage = BoxRefinementStage::new(&stages, &neck);
        let feats = features();
        let meta = ImageViewMeta::identity((60, 80));
        let cfg = AugTestConfig::new();
        let det = stage
            .call(&[AugView::new(&feats, &meta)], Array2::<f32>::zeros((0, 5)).view(), &cfg)
            .unwrap();
        assert!(det.is_empty());
        assert_eq!(det.boxes.ncols(), 5);
        assert!(calls.iter().all(|c| c.get() == 0));

        let single = stage
            .simple_test_bboxes(AugView::new(&feats, &meta), Array2::<f32>::zeros((0, 5)).view(), &cfg, true)
            .unwrap();
        assert!(single.is_empty());
    }

    #[test]
    fn test_simple_test_rescales() {
        let (stages, _) = box_stages(&[array![0.0, 3.0, 0.0]]);
        let neck = IdentityTransform;
        let stage = BoxRefinementStage::new(&stages, &neck);
        let feats = features();
        let meta = ImageViewMeta::new((60, 80), (120, 160), ScaleFactor::Uniform(2.0), false);
        let cfg = AugTestConfig::new();
        let det = stage
            .simple_test_bboxes(
                AugView::new(&feats, &meta),
                array![[20.0, 20.0, 60.0, 60.0, 0.9]].view(),
                &cfg,
                true,
            )
            .unwrap();
        assert_eq!(det.len(), 1);
        assert!((det.boxes[(0, 2)] - 30.0).abs() < 1e-3);
    }
}
