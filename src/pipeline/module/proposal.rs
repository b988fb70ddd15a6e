use ndarray::Array2;
use tracing::debug;

use crate::error::{AugTestError, Result};
use crate::pipeline::config::AugTestConfig;
use crate::processing::merge::merge_aug_proposals;
use crate::rcnn::heads::RpnHead;
use crate::rcnn::meta::AugView;
use crate::rcnn::result::ViewProposals;

/// Proposal stage: runs the RPN on every view and pools the proposals in the
/// original image frame.
pub struct ProposalStage<'a> {
    rpn_head: &'a dyn RpnHead,
}

impl<'a> ProposalStage<'a> {
    /// new creates new ProposalStage instance.
    pub fn new(rpn_head: &'a dyn RpnHead) -> Self {
        ProposalStage { rpn_head }
    }

    /// generate_view_proposals runs the proposal head on one view.
    ///
    /// The proposals stay in the view's frame.
    pub fn generate_view_proposals(
        &self,
        view: AugView,
        cfg: &AugTestConfig,
    ) -> Result<ViewProposals> {
        let proposals = self.rpn_head.get_proposals(view.features, view.meta, &cfg.rpn)?;
        if proposals.nrows() > 0 && proposals.ncols() != 5 {
            return Err(AugTestError::shape("rpn proposal columns", 5, proposals.ncols()));
        }
        let proposals = if proposals.nrows() == 0 {
            Array2::zeros((0, 5))
        } else {
            proposals
        };
        Ok(ViewProposals {
            proposals,
            meta: view.meta.clone(),
        })
    }

    /// merge_view_proposals pools per-view proposals into one k * 5 set in the
    /// original frame, suppressed and capped at `rpn.max_num`.
    pub fn merge_view_proposals(
        &self,
        views: &[ViewProposals],
        cfg: &AugTestConfig,
    ) -> Result<Array2<f32>> {
        merge_aug_proposals(views, &cfg.rpn, cfg.flip_order)
    }

    /// call runs the proposal stage over all views.
    pub fn call(&self, views: &[AugView], cfg: &AugTestConfig) -> Result<Array2<f32>> {
        let mut per_view = Vec::with_capacity(views.len());
        for view in views {
            per_view.push(self.generate_view_proposals(*view, cfg)?);
        }
        let merged = self.merge_view_proposals(&per_view, cfg)?;
        debug!(views = views.len(), proposals = merged.nrows(), "proposal stage done");
        Ok(merged)
    }

    /// simple_test_rpn returns one view's proposals in its own frame.
    pub fn simple_test_rpn(&self, view: AugView, cfg: &AugTestConfig) -> Result<Array2<f32>> {
        Ok(self.generate_view_proposals(view, cfg)?.proposals)
    }
}
