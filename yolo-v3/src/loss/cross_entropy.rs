use crate::common::*;

/// Softmax cross-entropy against dense (one-hot or soft) targets.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// Computes the loss over the last dimension. The output drops that dimension.
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Tensor {
        debug_assert_eq!(
            input.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );

        let log_prob = input.log_softmax(-1, Kind::Float);
        -(target * log_prob).sum_dim_intlist(&[-1], false, Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_entropy_values() {
        let loss_fn = CrossEntropyLoss::new();
        let input = Tensor::of_slice(&[0.0f32, 0.0, 0.0, 10.0, -10.0, -10.0]).view([2, 3]);
        let target = Tensor::of_slice(&[1.0f32, 0.0, 0.0, 1.0, 0.0, 0.0]).view([2, 3]);
        let loss = loss_fn.forward(&input, &target);

        assert_eq!(loss.size(), vec![2]);
        assert_abs_diff_eq!(f64::from(loss.i(0)), 3f64.ln(), epsilon = 1e-5);
        assert!(f64::from(loss.i(1)) < 1e-4);
    }
}
