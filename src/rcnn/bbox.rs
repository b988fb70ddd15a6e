use ndarray::{s, Array2, ArrayView1, ArrayView2};

use crate::error::{AugTestError, Result};
use crate::pipeline::config::FlipOrder;
use crate::rcnn::meta::{ImageViewMeta, ScaleFactor};

/// Boxes use inclusive integer-pixel extents: a box from 0 to 9 is 10 pixels wide.
pub const PIXEL_OFFSET: f32 = 1.0;

fn box_area(b: ArrayView1<f32>) -> f32 {
    (b[2] - b[0] + PIXEL_OFFSET) * (b[3] - b[1] + PIXEL_OFFSET)
}

/// iou of two `(x1, y1, x2, y2)` boxes under the inclusive-pixel convention.
pub fn iou(a: ArrayView1<f32>, b: ArrayView1<f32>) -> f32 {
    let iw = a[2].min(b[2]) - a[0].max(b[0]) + PIXEL_OFFSET;
    let ih = a[3].min(b[3]) - a[1].max(b[1]) + PIXEL_OFFSET;
    if iw <= 0.0 || ih <= 0.0 {
        return 0.0;
    }
    let inter = iw * ih;
    inter / (box_area(a) + box_area(b) - inter).max(1.0e-10)
}

/// bbox_overlaps returns the n * k IoU matrix of `boxes` against `query_boxes`.
/// Only the first four columns of either input are read.
pub fn bbox_overlaps(boxes: ArrayView2<f32>, query_boxes: ArrayView2<f32>) -> Array2<f32> {
    Array2::from_shape_fn((boxes.nrows(), query_boxes.nrows()), |(i, j)| {
        iou(boxes.row(i), query_boxes.row(j))
    })
}

fn check_box_columns(boxes: &ArrayView2<f32>) -> Result<()> {
    let cols = boxes.ncols();
    if cols == 0 || cols % 4 != 0 {
        return Err(AugTestError::shape(
            "box matrix columns (multiple of 4)",
            4 * (cols / 4).max(1),
            cols,
        ));
    }
    Ok(())
}

/// Reflects every `(x1, y1, x2, y2)` group about an image of the given width.
fn flip_in_place(boxes: &mut Array2<f32>, width: usize) {
    let w = width as f32;
    for mut row in boxes.outer_iter_mut() {
        for g in 0..row.len() / 4 {
            let x1 = row[4 * g];
            let x2 = row[4 * g + 2];
            row[4 * g] = w - x2 - PIXEL_OFFSET;
            row[4 * g + 2] = w - x1 - PIXEL_OFFSET;
        }
    }
}

fn rescale_in_place(boxes: &mut Array2<f32>, factors: [f32; 4], divide: bool) {
    for mut row in boxes.outer_iter_mut() {
        for (i, v) in row.iter_mut().enumerate() {
            if divide {
                *v /= factors[i % 4];
            } else {
                *v *= factors[i % 4];
            }
        }
    }
}

/// scale_boxes multiplies boxes by a scale factor without flipping them.
pub fn scale_boxes(boxes: ArrayView2<f32>, scale_factor: ScaleFactor) -> Result<Array2<f32>> {
    check_box_columns(&boxes)?;
    let mut scaled = boxes.to_owned();
    rescale_in_place(&mut scaled, scale_factor.as_box(), false);
    Ok(scaled)
}

/// map_to_view maps original-image boxes into a view's frame (forward augmentation).
pub fn map_to_view(
    boxes: ArrayView2<f32>,
    meta: &ImageViewMeta,
    order: FlipOrder,
) -> Result<Array2<f32>> {
    check_box_columns(&boxes)?;
    let mut mapped = boxes.to_owned();
    let factors = meta.scale_factor.as_box();
    match (meta.is_flipped, order) {
        (false, _) => rescale_in_place(&mut mapped, factors, false),
        (true, FlipOrder::FlipAfterResize) => {
            rescale_in_place(&mut mapped, factors, false);
            flip_in_place(&mut mapped, meta.view_shape.1);
        }
        (true, FlipOrder::FlipBeforeResize) => {
            flip_in_place(&mut mapped, meta.original_shape.1);
            rescale_in_place(&mut mapped, factors, false);
        }
    }
    Ok(mapped)
}

/// map_to_original maps view-local boxes back to the original image, undoing
/// the forward steps in reverse order.
pub fn map_to_original(
    boxes: ArrayView2<f32>,
    meta: &ImageViewMeta,
    order: FlipOrder,
) -> Result<Array2<f32>> {
    check_box_columns(&boxes)?;
    let mut mapped = boxes.to_owned();
    let factors = meta.scale_factor.as_box();
    match (meta.is_flipped, order) {
        (false, _) => rescale_in_place(&mut mapped, factors, true),
        (true, FlipOrder::FlipAfterResize) => {
            flip_in_place(&mut mapped, meta.view_shape.1);
            rescale_in_place(&mut mapped, factors, true);
        }
        (true, FlipOrder::FlipBeforeResize) => {
            rescale_in_place(&mut mapped, factors, true);
            flip_in_place(&mut mapped, meta.original_shape.1);
        }
    }
    Ok(mapped)
}

/// bbox2roi converts per-image box lists to `[batch_idx, x1, y1, x2, y2]` rows.
pub fn bbox2roi(bbox_list: &[ArrayView2<f32>]) -> Result<Array2<f32>> {
    let total: usize = bbox_list.iter().map(|b| b.nrows()).sum();
    let mut rois = Array2::<f32>::zeros((total, 5));
    let mut offset = 0;
    for (img_id, bboxes) in bbox_list.iter().enumerate() {
        if bboxes.nrows() == 0 {
            continue;
        }
        if bboxes.ncols() < 4 {
            return Err(AugTestError::shape("bbox2roi box columns", 4, bboxes.ncols()));
        }
        let n = bboxes.nrows();
        let mut block = rois.slice_mut(s![offset..offset + n, ..]);
        block.column_mut(0).fill(img_id as f32);
        block.slice_mut(s![.., 1..5]).assign(&bboxes.slice(s![.., ..4]));
        offset += n;
    }
    Ok(rois)
}

/// Strips the batch index column from RoIs.
pub fn roi_boxes(rois: &Array2<f32>) -> ArrayView2<f32> {
    rois.slice(s![.., 1..5])
}
