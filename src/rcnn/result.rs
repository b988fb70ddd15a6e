use ndarray::{Array1, Array2, Array4};

use crate::rcnn::meta::ImageViewMeta;

/// Final detections in original-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    /// n * 5 rows of `(x1, y1, x2, y2, score)`.
    pub boxes: Array2<f32>,
    /// 0-based foreground class of every row.
    pub labels: Array1<usize>,
}

impl DetectionResult {
    pub fn empty() -> Self {
        DetectionResult {
            boxes: Array2::zeros((0, 5)),
            labels: Array1::zeros(0),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.nrows() == 0
    }
}

/// One binary mask list per foreground class; empty classes keep their slot.
pub type SegmentationResult = Vec<Vec<Array2<u8>>>;

/// A view's proposals, still in the view's frame.
#[derive(Debug, Clone)]
pub struct ViewProposals {
    /// n * 5 rows of `(x1, y1, x2, y2, objectness)`.
    pub proposals: Array2<f32>,
    pub meta: ImageViewMeta,
}

/// A view's raw box branch output, still in the view's frame.
#[derive(Debug, Clone)]
pub struct ViewDetections {
    /// n * 4 or n * (4 * num_classes).
    pub boxes: Array2<f32>,
    /// n * num_classes, column 0 is background.
    pub scores: Array2<f32>,
    pub meta: ImageViewMeta,
}

/// A view's mask probabilities, one `(n, C, M, M)` map per cascade stage.
#[derive(Debug, Clone)]
pub struct ViewMaskProbs {
    pub stages: Vec<Array4<f32>>,
    pub meta: ImageViewMeta,
}
