use ndarray::{s, Array2, Array4, ArrayView2, Axis};
use tracing::debug;

use crate::error::{AugTestError, Result};
use crate::pipeline::config::{BoxMergeMode, FlipOrder, RpnTestConfig};
use crate::processing::nms::nms;
use crate::rcnn::bbox::map_to_original;
use crate::rcnn::result::{ViewDetections, ViewProposals};

/// merge_scores averages equally shaped matrices elementwise.
///
/// Used for class scores and for box coordinates alike.
pub fn merge_scores(items: &[ArrayView2<f32>]) -> Result<Array2<f32>> {
    let first = match items.first() {
        Some(first) => first,
        None => return Err(AugTestError::InvalidConfig("nothing to merge".to_string())),
    };
    let mut sum = Array2::<f32>::zeros(first.raw_dim());
    for item in items {
        if item.dim() != first.dim() {
            return Err(AugTestError::shape("merge_scores rows", first.nrows(), item.nrows()));
        }
        sum += item;
    }
    Ok(sum / items.len() as f32)
}

/// merge_aug_proposals maps every view's proposals back to the original image,
/// then suppresses overlaps and keeps the `max_num` best.
///
/// * `aug_proposals` - per view n * 5 `(x1, y1, x2, y2, objectness)`
/// * `return` - k * 5 sorted by descending objectness
pub fn merge_aug_proposals(
    aug_proposals: &[ViewProposals],
    rpn_test_cfg: &RpnTestConfig,
    flip_order: FlipOrder,
) -> Result<Array2<f32>> {
    let mut recovered: Vec<Array2<f32>> = Vec::with_capacity(aug_proposals.len());
    for view in aug_proposals {
        if view.proposals.nrows() == 0 {
            continue;
        }
        if view.proposals.ncols() != 5 {
            return Err(AugTestError::shape("proposal columns", 5, view.proposals.ncols()));
        }
        let mut proposals = view.proposals.clone();
        let boxes = map_to_original(view.proposals.slice(s![.., ..4]), &view.meta, flip_order)?;
        proposals.slice_mut(s![.., ..4]).assign(&boxes);
        recovered.push(proposals);
    }
    if recovered.is_empty() {
        return Ok(Array2::zeros((0, 5)));
    }

    let views: Vec<ArrayView2<f32>> = recovered.iter().map(|p| p.view()).collect();
    let all = ndarray::concatenate(Axis(0), &views)?;

    // nms returns survivors best first, ties in input order
    let mut keep = nms(all.view(), rpn_test_cfg.nms_thr);
    keep.truncate(rpn_test_cfg.max_num);
    debug!(
        views = aug_proposals.len(),
        candidates = all.nrows(),
        kept = keep.len(),
        "merged proposals"
    );
    Ok(all.select(Axis(0), &keep))
}

/// merge_aug_bboxes maps every view's boxes back to the original image and fuses them.
///
/// * `return` - `(boxes, scores)` in the original frame
pub fn merge_aug_bboxes(
    aug: &[ViewDetections],
    mode: BoxMergeMode,
    flip_order: FlipOrder,
) -> Result<(Array2<f32>, Array2<f32>)> {
    let first = match aug.first() {
        Some(first) => first,
        None => return Err(AugTestError::InvalidConfig("no views to merge".to_string())),
    };
    let mut recovered: Vec<Array2<f32>> = Vec::with_capacity(aug.len());
    for view in aug {
        if view.boxes.nrows() != view.scores.nrows() {
            return Err(AugTestError::shape(
                "view box rows",
                view.scores.nrows(),
                view.boxes.nrows(),
            ));
        }
        if view.boxes.ncols() != first.boxes.ncols() {
            return Err(AugTestError::shape(
                "view box columns",
                first.boxes.ncols(),
                view.boxes.ncols(),
            ));
        }
        if view.scores.ncols() != first.scores.ncols() {
            return Err(AugTestError::shape(
                "view score columns",
                first.scores.ncols(),
                view.scores.ncols(),
            ));
        }
        recovered.push(map_to_original(view.boxes.view(), &view.meta, flip_order)?);
    }

    let box_views: Vec<ArrayView2<f32>> = recovered.iter().map(|b| b.view()).collect();
    let score_views: Vec<ArrayView2<f32>> = aug.iter().map(|v| v.scores.view()).collect();

    match mode {
        BoxMergeMode::Average => {
            for view in aug {
                if view.boxes.nrows() != first.boxes.nrows() {
                    return Err(AugTestError::shape(
                        "candidates per view",
                        first.boxes.nrows(),
                        view.boxes.nrows(),
                    ));
                }
            }
            Ok((merge_scores(&box_views)?, merge_scores(&score_views)?))
        }
        BoxMergeMode::Concatenate => Ok((
            ndarray::concatenate(Axis(0), &box_views)?,
            ndarray::concatenate(Axis(0), &score_views)?,
        )),
    }
}

/// Reverses the width axis of a `(n, C, M, M)` map.
pub fn flip_mask_grid(masks: &Array4<f32>) -> Array4<f32> {
    masks.slice(s![.., .., .., ..;-1]).to_owned()
}

/// merge_aug_masks averages probability maps that share one canonical grid.
///
/// Maps flagged `flipped` are mirrored back along the width axis first.
/// `weights`, when given, turn the mean into a weighted average.
pub fn merge_aug_masks(
    aug_masks: &[(&Array4<f32>, bool)],
    weights: Option<&[f32]>,
) -> Result<Array4<f32>> {
    let (first, _) = match aug_masks.first() {
        Some(first) => *first,
        None => return Err(AugTestError::InvalidConfig("no masks to merge".to_string())),
    };
    if let Some(weights) = weights {
        if weights.len() != aug_masks.len() {
            return Err(AugTestError::shape("mask merge weights", aug_masks.len(), weights.len()));
        }
    }

    let mut merged = Array4::<f32>::zeros(first.raw_dim());
    let mut total = 0.0;
    for (i, (masks, flipped)) in aug_masks.iter().enumerate() {
        if masks.dim() != first.dim() {
            return Err(AugTestError::shape(
                "mask instances",
                first.shape()[0],
                masks.shape()[0],
            ));
        }
        let w = weights.map(|w| w[i]).unwrap_or(1.0);
        if *flipped {
            merged.scaled_add(w, &flip_mask_grid(masks));
        } else {
            merged.scaled_add(w, *masks);
        }
        total += w;
    }
    if total <= 0.0 {
        return Err(AugTestError::InvalidConfig(
            "mask merge weights sum to zero".to_string(),
        ));
    }
    Ok(merged / total)
}
