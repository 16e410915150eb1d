use crate::common::*;

/// Binary cross-entropy on probabilities clamped to `[eps, 1 - eps]`.
#[derive(Debug, Clone)]
pub struct BceLossInit {
    pub eps: f64,
}

impl BceLossInit {
    pub fn build(self) -> Result<BceLoss> {
        let Self { eps } = self;
        ensure!(
            eps > 0.0 && eps < 0.5,
            "eps must be in range (0, 0.5), but get {}",
            eps
        );
        Ok(BceLoss { eps })
    }
}

impl Default for BceLossInit {
    fn default() -> Self {
        Self { eps: 1e-7 }
    }
}

#[derive(Debug, Clone)]
pub struct BceLoss {
    eps: f64,
}

impl BceLoss {
    /// Element-wise loss without reduction.
    pub fn forward(&self, prob: &Tensor, target: &Tensor) -> Tensor {
        debug_assert_eq!(
            prob.size(),
            target.size(),
            "input and target tensors must have equal shape"
        );

        let prob = prob.clamp(self.eps, 1.0 - self.eps);
        -(target * prob.log() + (1.0_f64 - target) * (1.0_f64 - &prob).log())
    }
}
