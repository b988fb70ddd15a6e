use image::imageops::{resize, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::{s, Array1, Array2, ArrayView2, ArrayView4};

use crate::error::{AugTestError, Result};
use crate::rcnn::bbox::PIXEL_OFFSET;
use crate::rcnn::meta::ScaleFactor;
use crate::rcnn::result::SegmentationResult;

/// Settings the mask decoder needs from the mask head and the test config.
#[derive(Debug, Clone, Copy)]
pub struct SegMaskParams {
    /// Including background.
    pub num_classes: usize,
    pub class_agnostic: bool,
    pub mask_thr_binary: f32,
}

/// Resizes one canonical `M x M` probability map to `width x height` (bilinear).
fn resize_prob_map(map: ArrayView2<f32>, width: usize, height: usize) -> Result<Array2<f32>> {
    let (rows, cols) = map.dim();
    let raw: Vec<f32> = map.iter().cloned().collect();
    let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
        match ImageBuffer::from_raw(cols as u32, rows as u32, raw) {
            Some(buffer) => buffer,
            None => return Err(AugTestError::shape("mask map pixels", rows * cols, 0)),
        };
    let resized = resize(&buffer, width as u32, height as u32, FilterType::Triangle);
    Ok(Array2::from_shape_vec((height, width), resized.into_raw())?)
}

/// get_seg_masks pastes every instance's probability map into an image-sized
/// binary canvas and groups the canvases by class.
///
/// * `mask_probs` - n * C * M * M post-sigmoid probabilities (C = 1 when class agnostic)
/// * `det_bboxes` - n * 4 (or 5 with score) boxes
/// * `det_labels` - 0-based foreground labels
/// * `ori_shape` - `(height, width)` of the original image
/// * `rescale` - boxes are in the scaled frame and the canvas is the original
///   image; otherwise boxes and canvas are both in the scaled frame
pub fn get_seg_masks(
    mask_probs: ArrayView4<f32>,
    det_bboxes: ArrayView2<f32>,
    det_labels: &Array1<usize>,
    params: SegMaskParams,
    ori_shape: (usize, usize),
    scale_factor: ScaleFactor,
    rescale: bool,
) -> Result<SegmentationResult> {
    let num_fg = params.num_classes.saturating_sub(1);
    let mut cls_segms: SegmentationResult = vec![Vec::new(); num_fg];
    let n = det_bboxes.nrows();
    if n == 0 {
        return Ok(cls_segms);
    }
    if det_labels.len() != n {
        return Err(AugTestError::shape("mask labels", n, det_labels.len()));
    }
    if mask_probs.shape()[0] != n {
        return Err(AugTestError::shape("mask maps", n, mask_probs.shape()[0]));
    }

    let (img_h, img_w, scale_factor) = if rescale {
        (ori_shape.0, ori_shape.1, scale_factor)
    } else {
        (
            (ori_shape.0 as f32 * scale_factor.y()).round() as usize,
            (ori_shape.1 as f32 * scale_factor.x()).round() as usize,
            ScaleFactor::Uniform(1.0),
        )
    };

    for i in 0..n {
        let label = det_labels[i];
        if label >= num_fg {
            return Err(AugTestError::shape("mask label", num_fg, label));
        }
        let channel = if params.class_agnostic { 0 } else { label + 1 };
        if channel >= mask_probs.shape()[1] {
            return Err(AugTestError::shape("mask channels", channel + 1, mask_probs.shape()[1]));
        }

        let x1 = (det_bboxes[(i, 0)] / scale_factor.x()) as i64;
        let y1 = (det_bboxes[(i, 1)] / scale_factor.y()) as i64;
        let x2 = (det_bboxes[(i, 2)] / scale_factor.x()) as i64;
        let y2 = (det_bboxes[(i, 3)] / scale_factor.y()) as i64;
        let w = (x2 - x1 + PIXEL_OFFSET as i64).max(1) as usize;
        let h = (y2 - y1 + PIXEL_OFFSET as i64).max(1) as usize;

        let bbox_mask = resize_prob_map(mask_probs.slice(s![i, channel, .., ..]), w, h)?
            .mapv(|p| u8::from(p > params.mask_thr_binary));

        let mut im_mask = Array2::<u8>::zeros((img_h, img_w));
        // paste window clipped to the canvas
        let cx1 = x1.clamp(0, img_w as i64) as usize;
        let cy1 = y1.clamp(0, img_h as i64) as usize;
        let cx2 = (x1 + w as i64).clamp(0, img_w as i64) as usize;
        let cy2 = (y1 + h as i64).clamp(0, img_h as i64) as usize;
        if cx2 > cx1 && cy2 > cy1 {
            let mx = (cx1 as i64 - x1) as usize;
            let my = (cy1 as i64 - y1) as usize;
            im_mask
                .slice_mut(s![cy1..cy2, cx1..cx2])
                .assign(&bbox_mask.slice(s![my..my + (cy2 - cy1), mx..mx + (cx2 - cx1)]));
        }
        cls_segms[label].push(im_mask);
    }
    Ok(cls_segms)
}
