use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use tracing::trace;

use crate::error::{AugTestError, Result};
use crate::rcnn::bbox::iou;
use crate::rcnn::result::DetectionResult;

/// Indices of `scores` sorted by descending value; equal scores keep input order.
/// NaN scores sort ahead of every finite score.
pub fn descending_order(scores: ArrayView1<f32>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order
}

// greedily select boxes with high confidence and overlap with current maximum <= thresh
// rule out overlap > thresh
//   :param dets: [[x1, y1, x2, y2 score]]
//   :param thresh: retain overlap <= thresh
//   :return: indexes to keep, best first
pub fn nms(dets: ArrayView2<f32>, thresh: f32) -> Vec<usize> {
    if dets.nrows() == 0 {
        return Vec::new();
    }
    let mut order = descending_order(dets.column(4));
    let mut keep = Vec::new();

    while !order.is_empty() {
        let i = order[0];
        keep.push(i);

        order = order[1..]
            .iter()
            .copied()
            .filter(|&j| iou(dets.row(i), dets.row(j)) <= thresh)
            .collect();
    }

    keep
}

/// multiclass_nms runs class-wise suppression over per-class boxes and scores.
///
/// * `multi_bboxes` - n * 4 (shared by every class) or n * (4 * num_classes)
/// * `multi_scores` - n * num_classes, column 0 is background and skipped
/// * `return` - at most `max_per_img` detections (0 disables the cap), labels 0-based
pub fn multiclass_nms(
    multi_bboxes: ArrayView2<f32>,
    multi_scores: ArrayView2<f32>,
    score_thr: f32,
    iou_thr: f32,
    max_per_img: usize,
) -> Result<DetectionResult> {
    let num_classes = multi_scores.ncols();
    if multi_bboxes.nrows() != multi_scores.nrows() {
        return Err(AugTestError::shape(
            "multiclass_nms box rows",
            multi_scores.nrows(),
            multi_bboxes.nrows(),
        ));
    }
    let class_agnostic = multi_bboxes.ncols() == 4;
    if !class_agnostic && multi_bboxes.ncols() != 4 * num_classes {
        return Err(AugTestError::shape(
            "multiclass_nms box columns",
            4 * num_classes,
            multi_bboxes.ncols(),
        ));
    }

    let mut dets: Vec<Array2<f32>> = Vec::new();
    let mut labels: Vec<usize> = Vec::new();

    for cls in 1..num_classes {
        let cls_inds: Vec<usize> = multi_scores
            .column(cls)
            .iter()
            .enumerate()
            .filter(|(_, &score)| score > score_thr)
            .map(|(i, _)| i)
            .collect();
        if cls_inds.is_empty() {
            continue;
        }

        let cls_boxes = if class_agnostic {
            multi_bboxes.select(Axis(0), &cls_inds)
        } else {
            multi_bboxes
                .slice(s![.., 4 * cls..4 * cls + 4])
                .select(Axis(0), &cls_inds)
        };
        let mut cls_dets = Array2::<f32>::zeros((cls_inds.len(), 5));
        cls_dets.slice_mut(s![.., ..4]).assign(&cls_boxes);
        for (row, &i) in cls_inds.iter().enumerate() {
            cls_dets[(row, 4)] = multi_scores[(i, cls)];
        }

        let keep = nms(cls_dets.view(), iou_thr);
        trace!(class = cls, candidates = cls_inds.len(), kept = keep.len(), "class nms");
        labels.extend(std::iter::repeat(cls - 1).take(keep.len()));
        dets.push(cls_dets.select(Axis(0), &keep));
    }

    if dets.is_empty() {
        return Ok(DetectionResult::empty());
    }

    let views: Vec<ArrayView2<f32>> = dets.iter().map(|d| d.view()).collect();
    let mut boxes = ndarray::concatenate(Axis(0), &views)?;
    let mut labels = Array1::from(labels);

    if max_per_img > 0 && boxes.nrows() > max_per_img {
        let mut order = descending_order(boxes.column(4));
        order.truncate(max_per_img);
        boxes = boxes.select(Axis(0), &order);
        labels = labels.select(Axis(0), &order);
    }

    Ok(DetectionResult { boxes, labels })
}

#[cfg(test)]
mod tests {
    use ndarray::{array, Array2};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;

    use crate::processing::nms::{descending_order, multiclass_nms, nms};

    #[test]
    fn test_nms() {
        let dets = array![
            [100.0, 100.0, 210.0, 210.0, 0.72],
            [250.0, 250.0, 420.0, 420.0, 0.8],
            [220.0, 220.0, 320.0, 330.0, 0.92],
            [100.0, 100.0, 210.0, 210.0, 0.6]
        ];

        let keep = nms(dets.view(), 0.4);
        assert_eq!(keep, vec![2, 1, 0]);
    }

    #[test]
    fn test_nms_ties_keep_input_order() {
        let dets = array![
            [0.0, 0.0, 10.0, 10.0, 0.5],
            [0.0, 0.0, 10.0, 10.0, 0.5],
            [50.0, 50.0, 60.0, 60.0, 0.5]
        ];
        assert_eq!(nms(dets.view(), 0.5), vec![0, 2]);
    }

    #[test]
    fn test_descending_order_with_nan() {
        let scores = array![0.5, f32::NAN, 0.9, 0.5];
        assert_eq!(descending_order(scores.view()), vec![1, 2, 0, 3]);

        let dets = array![[0.0, 0.0, 10.0, 10.0, f32::NAN], [50.0, 50.0, 60.0, 60.0, 0.4]];
        assert_eq!(nms(dets.view(), 0.5), vec![0, 1]);
    }

    #[test]
    fn test_nms_empty() {
        let dets = Array2::<f32>::zeros((0, 5));
        assert!(nms(dets.view(), 0.5).is_empty());
    }

    #[test]
    fn test_overlapping_same_class_keeps_best() {
        let boxes = array![[10.0, 10.0, 50.0, 50.0], [12.0, 12.0, 52.0, 52.0]];
        let scores = array![[0.1, 0.6], [0.2, 0.8]];
        let det = multiclass_nms(boxes.view(), scores.view(), 0.05, 0.5, 100).unwrap();

        assert_eq!(det.len(), 1);
        assert_eq!(det.labels[0], 0);
        assert!((det.boxes[(0, 4)] - 0.8).abs() < 1e-6);
        assert_eq!(det.boxes[(0, 0)], 12.0);
    }

    #[test]
    fn test_class_specific_boxes() {
        // one candidate, three classes with their own boxes
        let boxes = array![[0.0, 0.0, 1.0, 1.0, 10.0, 10.0, 20.0, 20.0, 30.0, 30.0, 40.0, 40.0]];
        let scores = array![[0.1, 0.7, 0.2]];
        let det = multiclass_nms(boxes.view(), scores.view(), 0.05, 0.5, 100).unwrap();

        assert_eq!(det.len(), 2);
        assert_eq!(det.labels.to_vec(), vec![0, 1]);
        assert_eq!(det.boxes.row(0).to_vec(), vec![10.0, 10.0, 20.0, 20.0, 0.7]);
        assert_eq!(det.boxes.row(1).to_vec(), vec![30.0, 30.0, 40.0, 40.0, 0.2]);
    }

    #[test]
    fn test_cap_and_threshold() {
        let n = 200;
        let corners = Array2::random((n, 2), Uniform::new(0.0f32, 900.0));
        let mut boxes = Array2::<f32>::zeros((n, 4));
        for i in 0..n {
            boxes[(i, 0)] = corners[(i, 0)];
            boxes[(i, 1)] = corners[(i, 1)];
            boxes[(i, 2)] = corners[(i, 0)] + 20.0;
            boxes[(i, 3)] = corners[(i, 1)] + 20.0;
        }
        let scores = Array2::random((n, 4), Uniform::new(0.0f32, 1.0));

        let score_thr = 0.3;
        let det = multiclass_nms(boxes.view(), scores.view(), score_thr, 0.5, 25).unwrap();
        assert!(det.len() <= 25);
        assert_eq!(det.labels.len(), det.len());
        assert!(det.boxes.column(4).iter().all(|&s| s >= score_thr));
        assert!(det.labels.iter().all(|&l| l < 3));
    }

    #[test]
    fn test_nothing_above_threshold() {
        let boxes = array![[0.0, 0.0, 10.0, 10.0]];
        let scores = array![[0.9, 0.01]];
        let det = multiclass_nms(boxes.view(), scores.view(), 0.05, 0.5, 100).unwrap();
        assert!(det.is_empty());
        assert_eq!(det.boxes.ncols(), 5);
    }

    #[test]
    fn test_row_mismatch() {
        let boxes = Array2::<f32>::zeros((2, 4));
        let scores = Array2::<f32>::zeros((3, 2));
        assert!(multiclass_nms(boxes.view(), scores.view(), 0.05, 0.5, 100).is_err());
    }
}
