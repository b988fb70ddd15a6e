use ndarray::{Array, Dimension};

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Elementwise sigmoid, turns mask logits into probabilities.
pub fn sigmoid_array<D: Dimension>(logits: Array<f32, D>) -> Array<f32, D> {
    logits.mapv_into(sigmoid)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use crate::utils::utils::{sigmoid, sigmoid_array};

    #[test]
    fn test_sigmoid() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        let probs = sigmoid_array(array![[-20.0, 20.0]]);
        assert!(probs[(0, 0)] < 1e-6);
        assert!(probs[(0, 1)] > 1.0 - 1e-6);
    }
}
