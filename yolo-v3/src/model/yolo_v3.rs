//! The YOLOv3 network with a Darknet-53 backbone.

use super::DetectionModel;
use crate::{common::*, geometry::channel};
use tch_goodies::{Activation, ConvBn2D, ConvBn2DInit};

/// The number of residual blocks of each backbone stage.
const STAGE_DEPTHS: [usize; 5] = [1, 2, 8, 8, 4];
/// The total down-sampling factor of the backbone.
const MAX_STRIDE: i64 = 32;

#[derive(Debug, Clone)]
pub struct YoloV3Init {
    pub input_channels: usize,
    pub num_classes: usize,
    /// The number of anchors on each scale.
    pub num_anchors: usize,
}

impl YoloV3Init {
    pub fn build<'p, P>(self, path: P) -> Result<YoloV3>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let path = path.borrow();
        let Self {
            input_channels,
            num_classes,
            num_anchors,
        } = self;

        ensure!(input_channels > 0, "input_channels must be positive");
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(num_anchors > 0, "num_anchors must be positive");
        let num_outputs = channel::CLASS_BEGIN + num_classes;

        // backbone
        let stem = ConvBn2DInit::new(input_channels, 32, 3).build(path / "stem");
        let stages: Vec<_> = STAGE_DEPTHS
            .iter()
            .enumerate()
            .map(|(index, &depth)| {
                let in_c = 32 << index;
                let out_c = in_c * 2;
                DarkStage::new(path / format!("stage_{}", index), in_c, out_c, depth)
            })
            .collect();

        // heads from the coarsest scale to the finest
        let heads: Vec<_> = [(1024, 512), (768, 256), (384, 128)]
            .iter()
            .enumerate()
            .map(|(index, &(in_c, mid_c))| {
                HeadBranch::new(
                    path / format!("head_{}", index),
                    in_c,
                    mid_c,
                    num_anchors * num_outputs,
                )
            })
            .collect();
        let laterals: Vec<_> = [(512, 256), (256, 128)]
            .iter()
            .enumerate()
            .map(|(index, &(in_c, out_c))| {
                ConvBn2DInit::new(in_c, out_c, 1).build(path / format!("lateral_{}", index))
            })
            .collect();

        Ok(YoloV3 {
            stem,
            stages,
            heads,
            laterals,
            num_anchors: num_anchors as i64,
            num_outputs: num_outputs as i64,
        })
    }
}

#[derive(Debug)]
pub struct YoloV3 {
    stem: ConvBn2D,
    stages: Vec<DarkStage>,
    heads: Vec<HeadBranch>,
    laterals: Vec<ConvBn2D>,
    num_anchors: i64,
    num_outputs: i64,
}

impl YoloV3 {
    /// Reshape a `[batch, anchors * outputs, h, w]` map to `[batch, h, w, anchors, outputs]`.
    fn reshape_output(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, _channels, height, width) = xs.size4()?;
        let output = xs
            .f_view([batch_size, self.num_anchors, self.num_outputs, height, width])?
            .permute(&[0, 3, 4, 1, 2])
            .contiguous();
        Ok(output)
    }
}

impl DetectionModel for YoloV3 {
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let (_batch_size, _channels, height, width) = input.size4()?;
        ensure!(
            height % MAX_STRIDE == 0 && width % MAX_STRIDE == 0,
            "input size {}x{} must be divisible by {}",
            height,
            width,
            MAX_STRIDE
        );

        // keep the outputs of the last three stages, at strides 8, 16 and 32
        let mut xs = input.apply_t(&self.stem, train);
        let mut routes = vec![];
        for (index, stage) in self.stages.iter().enumerate() {
            xs = stage.forward_t(&xs, train);
            if index >= 2 {
                routes.push(xs.shallow_clone());
            }
        }

        let mut outputs = vec![];
        let mut branch: Option<Tensor> = None;

        for (index, head) in self.heads.iter().enumerate() {
            let route = &routes[routes.len() - 1 - index];
            let xs = match branch {
                None => route.shallow_clone(),
                Some(prev) => {
                    let (_, _, route_h, route_w) = route.size4()?;
                    let lateral = prev
                        .apply_t(&self.laterals[index - 1], train)
                        .upsample_nearest2d(&[route_h, route_w], None, None);
                    Tensor::cat(&[lateral, route.shallow_clone()], 1)
                }
            };

            let (next_branch, output) = head.forward_t(&xs, train);
            outputs.push(self.reshape_output(&output)?);
            branch = Some(next_branch);
        }

        Ok(outputs)
    }
}

/// A strided convolution followed by residual blocks.
#[derive(Debug)]
struct DarkStage {
    downsample: ConvBn2D,
    blocks: Vec<(ConvBn2D, ConvBn2D)>,
}

impl DarkStage {
    fn new(path: nn::Path, in_c: usize, out_c: usize, depth: usize) -> Self {
        let downsample = ConvBn2DInit {
            s: 2,
            ..ConvBn2DInit::new(in_c, out_c, 3)
        }
        .build(&path / "downsample");

        let blocks = (0..depth)
            .map(|index| {
                let block_path = &path / format!("block_{}", index);
                let squeeze = ConvBn2DInit::new(out_c, out_c / 2, 1).build(&block_path / "conv_1");
                let expand = ConvBn2DInit::new(out_c / 2, out_c, 3).build(&block_path / "conv_2");
                (squeeze, expand)
            })
            .collect();

        Self { downsample, blocks }
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let xs = xs.apply_t(&self.downsample, train);
        self.blocks.iter().fold(xs, |xs, (squeeze, expand)| {
            let residual = xs.apply_t(squeeze, train).apply_t(expand, train);
            xs + residual
        })
    }
}

/// Five alternating convolutions, then a detection convolution and a linear output.
#[derive(Debug)]
struct HeadBranch {
    convs: Vec<ConvBn2D>,
    detect: ConvBn2D,
    output: ConvBn2D,
}

impl HeadBranch {
    fn new(path: nn::Path, in_c: usize, mid_c: usize, out_c: usize) -> Self {
        let convs = (0..5)
            .map(|index| {
                let (conv_in, conv_out, k) = match index {
                    0 => (in_c, mid_c, 1),
                    _ if index % 2 == 1 => (mid_c, mid_c * 2, 3),
                    _ => (mid_c * 2, mid_c, 1),
                };
                ConvBn2DInit::new(conv_in, conv_out, k).build(&path / format!("conv_{}", index))
            })
            .collect();
        let detect = ConvBn2DInit::new(mid_c, mid_c * 2, 3).build(&path / "detect");
        let output = ConvBn2DInit {
            activation: Activation::Linear,
            batch_norm: false,
            ..ConvBn2DInit::new(mid_c * 2, out_c, 1)
        }
        .build(&path / "output");

        Self {
            convs,
            detect,
            output,
        }
    }

    /// Returns the branch feature fed to the next scale and the raw output map.
    fn forward_t(&self, xs: &Tensor, train: bool) -> (Tensor, Tensor) {
        let branch = self
            .convs
            .iter()
            .fold(xs.shallow_clone(), |xs, conv| xs.apply_t(conv, train));
        let output = branch
            .apply_t(&self.detect, train)
            .apply_t(&self.output, train);
        (branch, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_shapes() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = YoloV3Init {
            input_channels: 3,
            num_classes: 2,
            num_anchors: 3,
        }
        .build(&vs.root() / "yolo")?;

        let input = Tensor::rand(&[1, 3, 64, 96], FLOAT_CPU);
        let outputs = tch::no_grad(|| model.forward_t(&input, false))?;
        let shapes: Vec<_> = outputs.iter().map(|output| output.size()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![1, 2, 3, 3, 7],
                vec![1, 4, 6, 3, 7],
                vec![1, 8, 12, 3, 7],
            ]
        );
        Ok(())
    }

    #[test]
    fn reject_indivisible_input() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut model = YoloV3Init {
            input_channels: 3,
            num_classes: 1,
            num_anchors: 3,
        }
        .build(&vs.root())?;

        let input = Tensor::rand(&[1, 3, 40, 64], FLOAT_CPU);
        assert!(model.forward_t(&input, false).is_err());
        Ok(())
    }
}
