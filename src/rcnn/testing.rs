//! Deterministic stand-ins for the network components, shared by unit tests.

use std::cell::Cell;
use std::rc::Rc;

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, Array4};

use crate::pipeline::config::{FlipOrder, RpnTestConfig};
use crate::rcnn::bbox::map_to_view;
use crate::rcnn::heads::{BBoxHead, CascadeBoxStage, CascadeMaskStage, MaskHead, RoiExtractor, RpnHead};
use crate::rcnn::meta::ImageViewMeta;

/// Proposes a fixed set of original-frame boxes, mapped into each view.
pub struct FixedRpn {
    pub proposals: Array2<f32>,
    pub calls: Rc<Cell<usize>>,
}

impl FixedRpn {
    pub fn new(proposals: Array2<f32>) -> Self {
        FixedRpn {
            proposals,
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl RpnHead for FixedRpn {
    fn get_proposals(
        &self,
        _features: &[Array4<f32>],
        meta: &ImageViewMeta,
        _cfg: &RpnTestConfig,
    ) -> Result<Array2<f32>> {
        self.calls.set(self.calls.get() + 1);
        let mut out = self.proposals.clone();
        if out.nrows() > 0 {
            let boxes = map_to_view(self.proposals.slice(s![.., ..4]), meta, FlipOrder::FlipAfterResize)?;
            out.slice_mut(s![.., ..4]).assign(&boxes);
        }
        Ok(out)
    }
}

/// Echoes each RoI row as a `(n, 5, 1, 1)` feature map.
pub struct RoiEcho;

impl RoiExtractor for RoiEcho {
    fn featmap_strides(&self) -> &[usize] {
        &[4]
    }

    fn extract(&self, features: &[Array4<f32>], rois: &Array2<f32>) -> Result<Array4<f32>> {
        if features.is_empty() {
            bail!("no feature levels");
        }
        let mut out = Array4::<f32>::zeros((rois.nrows(), 5, 1, 1));
        out.slice_mut(s![.., .., 0, 0]).assign(rois);
        Ok(out)
    }
}

/// Emits the same class logits for every RoI and zero regression deltas.
pub struct ConstBBoxHead {
    pub logits: Array1<f32>,
    pub calls: Rc<Cell<usize>>,
}

impl ConstBBoxHead {
    pub fn new(logits: Array1<f32>) -> Self {
        ConstBBoxHead {
            logits,
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl BBoxHead for ConstBBoxHead {
    fn num_classes(&self) -> usize {
        self.logits.len()
    }

    fn forward(&self, roi_feats: &Array4<f32>) -> Result<(Array2<f32>, Array2<f32>)> {
        self.calls.set(self.calls.get() + 1);
        let n = roi_feats.shape()[0];
        let c = self.logits.len();
        let mut cls_score = Array2::<f32>::zeros((n, c));
        for mut row in cls_score.outer_iter_mut() {
            row.assign(&self.logits);
        }
        Ok((cls_score, Array2::zeros((n, 4 * c))))
    }
}

/// Emits one constant logit everywhere on an `M x M` grid.
pub struct ConstMaskHead {
    pub num_classes: usize,
    pub logit: f32,
    pub size: usize,
    pub calls: Rc<Cell<usize>>,
}

impl ConstMaskHead {
    pub fn new(num_classes: usize, logit: f32) -> Self {
        ConstMaskHead {
            num_classes,
            logit,
            size: 4,
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl MaskHead for ConstMaskHead {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn forward(&self, roi_feats: &Array4<f32>) -> Result<Array4<f32>> {
        self.calls.set(self.calls.get() + 1);
        let n = roi_feats.shape()[0];
        Ok(Array4::from_elem(
            (n, self.num_classes, self.size, self.size),
            self.logit,
        ))
    }
}

/// Builds box stages whose heads emit `logits[i]`, plus their call counters.
pub fn box_stages(logits: &[Array1<f32>]) -> (Vec<CascadeBoxStage>, Vec<Rc<Cell<usize>>>) {
    let mut stages = Vec::new();
    let mut calls = Vec::new();
    for l in logits {
        let head = ConstBBoxHead::new(l.clone());
        calls.push(head.calls.clone());
        stages.push(CascadeBoxStage {
            roi_extractor: Box::new(RoiEcho),
            bbox_head: Box::new(head),
        });
    }
    (stages, calls)
}

/// Builds `count` mask stages sharing one call counter.
pub fn mask_stages(count: usize, num_classes: usize, logit: f32) -> (Vec<CascadeMaskStage>, Rc<Cell<usize>>) {
    let calls = Rc::new(Cell::new(0));
    let stages = (0..count)
        .map(|_| {
            let mut head = ConstMaskHead::new(num_classes, logit);
            head.calls = calls.clone();
            CascadeMaskStage {
                roi_extractor: Box::new(RoiEcho),
                mask_head: Box::new(head),
            }
        })
        .collect();
    (stages, calls)
}

/// A one-level feature pyramid; the stubs only check it is present.
pub fn features() -> Vec<Array4<f32>> {
    vec![Array4::zeros((1, 1, 2, 2))]
}
