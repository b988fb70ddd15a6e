use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{AugTestError, Result};

/// Resize factor between the original image and a view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScaleFactor {
    Uniform(f32),
    PerAxis { x: f32, y: f32 },
}

impl ScaleFactor {
    pub fn x(&self) -> f32 {
        match self {
            ScaleFactor::Uniform(s) => *s,
            ScaleFactor::PerAxis { x, .. } => *x,
        }
    }

    pub fn y(&self) -> f32 {
        match self {
            ScaleFactor::Uniform(s) => *s,
            ScaleFactor::PerAxis { y, .. } => *y,
        }
    }

    /// Factors for one `(x1, y1, x2, y2)` group.
    pub fn as_box(&self) -> [f32; 4] {
        [self.x(), self.y(), self.x(), self.y()]
    }
}

impl Default for ScaleFactor {
    fn default() -> Self {
        ScaleFactor::Uniform(1.0)
    }
}

/// Per-view augmentation record. Shapes are `(height, width)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageViewMeta {
    pub original_shape: (usize, usize),
    pub view_shape: (usize, usize),
    pub scale_factor: ScaleFactor,
    pub is_flipped: bool,
}

impl ImageViewMeta {
    /// new creates new ImageViewMeta instance.
    pub fn new(
        original_shape: (usize, usize),
        view_shape: (usize, usize),
        scale_factor: ScaleFactor,
        is_flipped: bool,
    ) -> Self {
        ImageViewMeta {
            original_shape,
            view_shape,
            scale_factor,
            is_flipped,
        }
    }

    /// identity creates the meta of an un-augmented view.
    pub fn identity(shape: (usize, usize)) -> Self {
        Self::new(shape, shape, ScaleFactor::Uniform(1.0), false)
    }

    /// flipped returns the same view with the flip flag set.
    pub fn flipped(&self) -> Self {
        ImageViewMeta {
            is_flipped: true,
            ..self.clone()
        }
    }
}

/// One augmented rendering of an image: its feature pyramid and the meta that
/// produced it, always carried together.
#[derive(Debug, Clone, Copy)]
pub struct AugView<'a> {
    pub features: &'a [Array4<f32>],
    pub meta: &'a ImageViewMeta,
}

impl<'a> AugView<'a> {
    pub fn new(features: &'a [Array4<f32>], meta: &'a ImageViewMeta) -> Self {
        AugView { features, meta }
    }

    /// zip pairs per-view feature pyramids with their metas.
    pub fn zip(features: &'a [Vec<Array4<f32>>], metas: &'a [ImageViewMeta]) -> Result<Vec<Self>> {
        if features.len() != metas.len() {
            return Err(AugTestError::shape("feature views vs metas", metas.len(), features.len()));
        }
        Ok(features
            .iter()
            .zip(metas.iter())
            .map(|(f, m)| AugView::new(f, m))
            .collect())
    }
}

/// Coordinate frame a box matrix is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Original,
    View,
}
