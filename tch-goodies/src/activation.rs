use crate::common::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Leaky,
    Logistic,
    Relu,
    Mish,
}

impl nn::Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        use Activation::*;

        match *self {
            Linear => xs.shallow_clone(),
            Leaky => xs.clamp_min(0.0) + xs.clamp_max(0.0) * 0.1,
            Logistic => xs.sigmoid(),
            Relu => xs.relu(),
            Mish => xs * &xs.softplus().tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::nn::Module as _;

    #[test]
    fn leaky_slope() {
        let xs = Tensor::of_slice(&[-2.0f32, 0.0, 3.0]);
        let ys = Activation::Leaky.forward(&xs);
        let ys: Vec<f32> = Vec::from(&ys);
        assert_eq!(ys.len(), 3);
        assert!((ys[0] + 0.2).abs() < 1e-6);
        assert!(ys[1].abs() < 1e-6);
        assert!((ys[2] - 3.0).abs() < 1e-6);
    }
}
