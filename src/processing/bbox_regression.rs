use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{AugTestError, Result};
use crate::rcnn::bbox::PIXEL_OFFSET;

/// Largest allowed log-ratio of predicted to reference width/height.
pub const WH_RATIO_CLIP: f32 = 16.0 / 1000.0;

/// Decodes regression deltas `(dx, dy, dw, dh)` into boxes.
///
/// Deltas are stored normalized by the per-stage target means and stds, which
/// differ between cascade stages (later stages regress finer offsets).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxCoder {
    pub target_means: [f32; 4],
    pub target_stds: [f32; 4],
    pub wh_ratio_clip: f32,
}

impl BoxCoder {
    /// new creates new BoxCoder instance.
    pub fn new(target_means: [f32; 4], target_stds: [f32; 4]) -> Self {
        BoxCoder {
            target_means,
            target_stds,
            wh_ratio_clip: WH_RATIO_CLIP,
        }
    }

    /// decode applies deltas to reference boxes.
    ///
    /// * `rois` - n * 4 reference boxes
    /// * `deltas` - n * (4 * k), one group per class
    /// * `max_shape` - `(height, width)` to clip to
    /// * `return` - n * (4 * k) boxes
    pub fn decode(
        &self,
        rois: ArrayView2<f32>,
        deltas: ArrayView2<f32>,
        max_shape: Option<(usize, usize)>,
    ) -> Result<Array2<f32>> {
        if rois.ncols() != 4 {
            return Err(AugTestError::shape("decode roi columns", 4, rois.ncols()));
        }
        if deltas.nrows() != rois.nrows() {
            return Err(AugTestError::shape("decode delta rows", rois.nrows(), deltas.nrows()));
        }
        if deltas.ncols() == 0 || deltas.ncols() % 4 != 0 {
            return Err(AugTestError::shape("decode delta columns", 4, deltas.ncols()));
        }

        let max_ratio = self.wh_ratio_clip.ln().abs();
        let mut boxes = Array2::<f32>::zeros(deltas.raw_dim());

        for ((roi, delta), mut out) in rois
            .outer_iter()
            .zip(deltas.outer_iter())
            .zip(boxes.outer_iter_mut())
        {
            let px = (roi[0] + roi[2]) * 0.5;
            let py = (roi[1] + roi[3]) * 0.5;
            let pw = roi[2] - roi[0] + PIXEL_OFFSET;
            let ph = roi[3] - roi[1] + PIXEL_OFFSET;

            for g in 0..delta.len() / 4 {
                let d = |i: usize| delta[4 * g + i] * self.target_stds[i] + self.target_means[i];
                let dx = d(0);
                let dy = d(1);
                let dw = d(2).clamp(-max_ratio, max_ratio);
                let dh = d(3).clamp(-max_ratio, max_ratio);

                let gw = pw * dw.exp();
                let gh = ph * dh.exp();
                let gx = px + pw * dx;
                let gy = py + ph * dy;

                let mut x1 = gx - gw * 0.5 + 0.5;
                let mut y1 = gy - gh * 0.5 + 0.5;
                let mut x2 = gx + gw * 0.5 - 0.5;
                let mut y2 = gy + gh * 0.5 - 0.5;

                if let Some((h, w)) = max_shape {
                    let max_x = w as f32 - PIXEL_OFFSET;
                    let max_y = h as f32 - PIXEL_OFFSET;
                    x1 = x1.clamp(0.0, max_x);
                    y1 = y1.clamp(0.0, max_y);
                    x2 = x2.clamp(0.0, max_x);
                    y2 = y2.clamp(0.0, max_y);
                }

                out[4 * g] = x1;
                out[4 * g + 1] = y1;
                out[4 * g + 2] = x2;
                out[4 * g + 3] = y2;
            }
        }
        Ok(boxes)
    }
}

impl Default for BoxCoder {
    fn default() -> Self {
        BoxCoder::new([0.0; 4], [0.1, 0.1, 0.2, 0.2])
    }
}

/// regress_by_class moves every RoI by the deltas of its chosen class.
///
/// * `rois` - n * 5 `[batch_idx, x1, y1, x2, y2]`
/// * `labels` - class per RoI, selects which 4 deltas are used
/// * `bbox_pred` - n * 4 when class agnostic, else n * (4 * num_classes)
/// * `return` - n * 5 with the batch index preserved
pub fn regress_by_class(
    coder: &BoxCoder,
    rois: &Array2<f32>,
    labels: &Array1<usize>,
    bbox_pred: ArrayView2<f32>,
    reg_class_agnostic: bool,
    max_shape: (usize, usize),
) -> Result<Array2<f32>> {
    if rois.ncols() != 5 {
        return Err(AugTestError::shape("regress_by_class roi columns", 5, rois.ncols()));
    }
    if labels.len() != rois.nrows() {
        return Err(AugTestError::shape("regress_by_class labels", rois.nrows(), labels.len()));
    }

    let deltas = if reg_class_agnostic {
        bbox_pred.slice(s![.., ..4]).to_owned()
    } else {
        let mut picked = Array2::<f32>::zeros((rois.nrows(), 4));
        for (i, &label) in labels.iter().enumerate() {
            let start = 4 * label;
            if start + 4 > bbox_pred.ncols() {
                return Err(AugTestError::shape(
                    "regress_by_class delta columns",
                    start + 4,
                    bbox_pred.ncols(),
                ));
            }
            picked
                .row_mut(i)
                .assign(&bbox_pred.slice(s![i, start..start + 4]));
        }
        picked
    };

    let boxes = coder.decode(rois.slice(s![.., 1..5]), deltas.view(), Some(max_shape))?;
    let mut new_rois = rois.clone();
    new_rois.slice_mut(s![.., 1..5]).assign(&boxes);
    Ok(new_rois)
}

/// Row-wise argmax.
pub fn argmax_rows(scores: ArrayView2<f32>) -> Array1<usize> {
    scores
        .outer_iter()
        .map(argmax)
        .collect::<Array1<usize>>()
}

fn argmax(row: ArrayView1<f32>) -> usize {
    let mut max_index = 0;
    let mut max_value = f32::NEG_INFINITY;
    for (i, &value) in row.iter().enumerate() {
        if value > max_value {
            max_value = value;
            max_index = i;
        }
    }
    max_index
}

/// Row-wise softmax over class logits.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();
    for mut row in probs.outer_iter_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    probs
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use crate::processing::bbox_regression::{argmax_rows, regress_by_class, softmax_rows, BoxCoder};

    #[test]
    fn test_zero_deltas_keep_boxes() {
        let coder = BoxCoder::default();
        let rois = array![[10.0, 20.0, 49.0, 59.0]];
        let deltas = array![[0.0, 0.0, 0.0, 0.0]];
        let boxes = coder.decode(rois.view(), deltas.view(), None).unwrap();
        assert_eq!(boxes, rois);
    }

    #[test]
    fn test_decode_shift_and_clip() {
        let coder = BoxCoder::new([0.0; 4], [1.0; 4]);
        let rois = array![[0.0, 0.0, 9.0, 9.0]];
        // shift right by one box width
        let deltas = array![[1.0, 0.0, 0.0, 0.0]];
        let boxes = coder.decode(rois.view(), deltas.view(), None).unwrap();
        assert_eq!(boxes, array![[10.0, 0.0, 19.0, 9.0]]);

        let clipped = coder.decode(rois.view(), deltas.view(), Some((20, 15))).unwrap();
        assert_eq!(clipped, array![[10.0, 0.0, 14.0, 9.0]]);
    }

    #[test]
    fn test_decode_clamps_scale() {
        let coder = BoxCoder::new([0.0; 4], [1.0; 4]);
        let rois = array![[0.0, 0.0, 9.0, 9.0]];
        let deltas = array![[0.0, 0.0, 100.0, 100.0]];
        let boxes = coder.decode(rois.view(), deltas.view(), None).unwrap();
        let width = boxes[(0, 2)] - boxes[(0, 0)] + 1.0;
        assert!((width - 10.0 * 1000.0 / 16.0).abs() < 1e-1);
    }

    #[test]
    fn test_regress_by_argmax_class() {
        let coder = BoxCoder::new([0.0; 4], [1.0; 4]);
        let rois = array![[0.0, 0.0, 0.0, 9.0, 9.0]];
        let scores = array![[0.1, 0.2, 0.7]];
        // class 1 would move down, class 2 moves right
        let bbox_pred = array![[0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0]];
        let labels = argmax_rows(scores.view());
        assert_eq!(labels.to_vec(), vec![2]);

        let new_rois =
            regress_by_class(&coder, &rois, &labels, bbox_pred.view(), false, (100, 100)).unwrap();
        assert_eq!(new_rois, array![[0.0, 10.0, 0.0, 19.0, 9.0]]);
    }

    #[test]
    fn test_regress_class_agnostic() {
        let coder = BoxCoder::new([0.0; 4], [1.0; 4]);
        let rois = array![[3.0, 0.0, 0.0, 9.0, 9.0]];
        let labels = array![5];
        let bbox_pred = array![[0.0, 1.0, 0.0, 0.0]];
        let new_rois =
            regress_by_class(&coder, &rois, &labels, bbox_pred.view(), true, (100, 100)).unwrap();
        assert_eq!(new_rois, array![[3.0, 0.0, 10.0, 9.0, 19.0]]);
    }

    #[test]
    fn test_softmax_rows() {
        let probs = softmax_rows(array![[0.0, 0.0], [1.0, 1.0 + 2.0f32.ln()]].view());
        assert!((probs[(0, 0)] - 0.5).abs() < 1e-6);
        assert!((probs[(1, 1)] - 2.0 / 3.0).abs() < 1e-5);
    }
}
