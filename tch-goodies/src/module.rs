//! Network building blocks.

use crate::{activation::Activation, common::*};

/// Convolution followed by batch normalization and activation.
#[derive(Debug, Clone)]
pub struct ConvBn2DInit {
    pub in_c: usize,
    pub out_c: usize,
    pub k: usize,
    pub s: usize,
    pub activation: Activation,
    pub batch_norm: bool,
}

impl ConvBn2DInit {
    pub fn new(in_c: usize, out_c: usize, k: usize) -> Self {
        Self {
            in_c,
            out_c,
            k,
            s: 1,
            activation: Activation::Leaky,
            batch_norm: true,
        }
    }

    pub fn build<'p, P>(self, path: P) -> ConvBn2D
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();

        let Self {
            in_c,
            out_c,
            k,
            s,
            activation,
            batch_norm,
        } = self;

        let conv = nn::conv2d(
            path / "conv",
            in_c as i64,
            out_c as i64,
            k as i64,
            nn::ConvConfig {
                stride: s as i64,
                padding: k as i64 / 2,
                // the bias is redundant under batch norm
                bias: !batch_norm,
                ..Default::default()
            },
        );
        let bn = batch_norm.then(|| nn::batch_norm2d(path / "bn", out_c as i64, Default::default()));

        ConvBn2D {
            conv,
            bn,
            activation,
        }
    }
}

#[derive(Debug)]
pub struct ConvBn2D {
    conv: nn::Conv2D,
    bn: Option<nn::BatchNorm>,
    activation: Activation,
}

impl nn::ModuleT for ConvBn2D {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.apply(&self.conv);
        let xs = match &self.bn {
            Some(bn) => xs.apply_t(bn, train),
            None => xs,
        };
        xs.apply(&self.activation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_bn_output_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let block = ConvBn2DInit {
            s: 2,
            ..ConvBn2DInit::new(3, 8, 3)
        }
        .build(&root / "block");

        let xs = Tensor::rand(&[2, 3, 16, 16], (Kind::Float, Device::Cpu));
        let ys = xs.apply_t(&block, true);
        assert_eq!(ys.size(), vec![2, 8, 8, 8]);
    }
}
