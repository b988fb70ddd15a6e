use ndarray::Array2;
use tracing::debug;

use crate::error::{AugTestError, Result};
use crate::pipeline::config::AugTestConfig;
use crate::pipeline::module::bbox_refinement::BoxRefinementStage;
use crate::pipeline::module::mask_decoding::MaskDecodingStage;
use crate::pipeline::module::proposal::ProposalStage;
use crate::rcnn::heads::{CascadeBoxStage, CascadeMaskStage, IdentityTransform, RegionFeatureTransform, RpnHead};
use crate::rcnn::meta::AugView;
use crate::rcnn::result::{DetectionResult, SegmentationResult};

/// Detections of one image, plus masks when the model has a mask branch.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub detections: DetectionResult,
    pub segmentation: Option<SegmentationResult>,
}

/// Chains proposal, box refinement and mask decoding for the single-view and
/// the augmented test paths.
pub struct CascadeTestPipeline {
    rpn_head: Box<dyn RpnHead>,
    box_stages: Vec<CascadeBoxStage>,
    mask_stages: Vec<CascadeMaskStage>,
    shared_head: Box<dyn RegionFeatureTransform>,
    config: AugTestConfig,
}

impl CascadeTestPipeline {
    /// new creates new CascadeTestPipeline instance.
    ///
    /// Fails with `InvalidConfig` when the stage components do not match
    /// `config.num_stages`.
    pub fn new(
        rpn_head: Box<dyn RpnHead>,
        box_stages: Vec<CascadeBoxStage>,
        mask_stages: Vec<CascadeMaskStage>,
        config: AugTestConfig,
    ) -> Result<Self> {
        config.validate(box_stages.len(), mask_stages.len())?;
        Ok(CascadeTestPipeline {
            rpn_head,
            box_stages,
            mask_stages,
            shared_head: Box::new(IdentityTransform),
            config,
        })
    }

    /// with_shared_head installs a neck run on every RoI feature batch.
    pub fn with_shared_head(mut self, shared_head: Box<dyn RegionFeatureTransform>) -> Self {
        self.shared_head = shared_head;
        self
    }

    pub fn config(&self) -> &AugTestConfig {
        &self.config
    }

    pub fn with_mask(&self) -> bool {
        !self.mask_stages.is_empty()
    }

    fn proposal_stage(&self) -> ProposalStage<'_> {
        ProposalStage::new(self.rpn_head.as_ref())
    }

    fn box_stage(&self) -> BoxRefinementStage<'_> {
        BoxRefinementStage::new(&self.box_stages, self.shared_head.as_ref())
    }

    fn mask_stage(&self) -> MaskDecodingStage<'_> {
        MaskDecodingStage::new(&self.mask_stages, self.shared_head.as_ref())
    }

    fn check_views(&self, views: &[AugView]) -> Result<()> {
        if views.is_empty() {
            return Err(AugTestError::InvalidConfig("at least one view is required".to_string()));
        }
        if let Some(weights) = &self.config.mask_merge_weights {
            if self.with_mask() && weights.len() != views.len() {
                return Err(AugTestError::InvalidConfig(format!(
                    "{} mask merge weights for {} views",
                    weights.len(),
                    views.len()
                )));
            }
        }
        Ok(())
    }

    /// simple_test_rpn returns one view's proposals in its own frame.
    pub fn simple_test_rpn(&self, view: AugView) -> Result<Array2<f32>> {
        self.proposal_stage().simple_test_rpn(view, &self.config)
    }

    /// aug_test_rpn returns merged proposals in the original frame.
    pub fn aug_test_rpn(&self, views: &[AugView]) -> Result<Array2<f32>> {
        self.check_views(views)?;
        self.proposal_stage().call(views, &self.config)
    }

    /// simple_test runs one view end to end. With `rescale` the results are
    /// in the original image frame, otherwise in the view's frame.
    pub fn simple_test(&self, view: AugView, rescale: bool) -> Result<PipelineOutput> {
        let proposals = self.simple_test_rpn(view)?;
        let detections = self
            .box_stage()
            .simple_test_bboxes(view, proposals.view(), &self.config, rescale)?;
        let segmentation = if self.with_mask() {
            Some(self.mask_stage().simple_test_mask(view, &detections, &self.config, rescale)?)
        } else {
            None
        };
        debug!(proposals = proposals.nrows(), detections = detections.len(), "simple test done");
        Ok(PipelineOutput {
            detections,
            segmentation,
        })
    }

    /// aug_test runs every view and fuses them. Results are in the original
    /// image frame.
    pub fn aug_test(&self, views: &[AugView]) -> Result<PipelineOutput> {
        self.check_views(views)?;
        let proposals = self.proposal_stage().call(views, &self.config)?;
        let detections = self.box_stage().call(views, proposals.view(), &self.config)?;
        let segmentation = if self.with_mask() {
            Some(self.mask_stage().call(views, &detections, &self.config)?)
        } else {
            None
        };
        debug!(
            views = views.len(),
            proposals = proposals.nrows(),
            detections = detections.len(),
            "aug test done"
        );
        Ok(PipelineOutput {
            detections,
            segmentation,
        })
    }
}
