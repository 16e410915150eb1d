//! Encoding ground truth boxes into dense multi-scale training targets.
//!
//! For each box the best-matching anchor over all scales is selected by
//! shape-only IoU. The box is written to that anchor's slot in the cell
//! containing the box center, as
//!
//! ```text
//! [x_offset, y_offset, width, height, 1.0, one_hot(class)...]
//! ```
//!
//! where the offsets are relative to the cell and `width`, `height` are the raw
//! ratio-unit box size. The size is *not* encoded as a log scale relative to the
//! anchor, so a target can be read back without looking up the anchor. The
//! loss function compares raw sizes accordingly; both sides must change
//! together if the encoding changes.

use crate::{
    common::*,
    geometry::{channel, AnchorIndex, Geometry},
};

/// Dense targets of one image on one scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTarget {
    /// Array of shape `[grid_h, grid_w, anchors, 5 + num_classes]`.
    pub target: Array4<f32>,
    /// Array of shape `[grid_h, grid_w, anchors]`. Marked slots are excluded
    /// from the no-object loss.
    pub ignore: Array3<bool>,
}

impl ScaleTarget {
    /// Whether the slot is responsible for a ground truth box.
    pub fn is_responsible(&self, row: usize, col: usize, anchor_index: usize) -> bool {
        self.target[[row, col, anchor_index, channel::OBJECTNESS]] == 1.0
    }
}

/// Dense targets of one image on all scales.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTarget {
    pub scales: Vec<ScaleTarget>,
    /// The number of boxes overwritten by a later box on the same slot.
    pub collisions: usize,
}

/// Dense targets of a batch of images on one scale.
#[derive(Debug, TensorLike)]
pub struct ScaleTargetTensor {
    /// Float tensor of shape `[batch, grid_h, grid_w, anchors, 5 + num_classes]`.
    pub target: Tensor,
    /// Bool tensor of shape `[batch, grid_h, grid_w, anchors]`.
    pub ignore: Tensor,
}

/// Dense targets of a batch of images on all scales.
#[derive(Debug, TensorLike)]
pub struct BatchTargets {
    pub scales: Vec<ScaleTargetTensor>,
}

impl BatchTargets {
    /// Stack per-image targets into batched tensors.
    pub fn from_images(images: &[ImageTarget], device: Device) -> Result<Self> {
        ensure!(!images.is_empty(), "cannot build targets from an empty batch");
        let num_scales = images[0].scales.len();
        ensure!(
            images.iter().all(|image| image.scales.len() == num_scales),
            "images have inconsistent number of scales"
        );

        let scales: Vec<_> = (0..num_scales)
            .map(|scale_index| -> Result<_> {
                let (targets, ignores): (Vec<_>, Vec<_>) = images
                    .iter()
                    .map(|image| -> Result<_> {
                        let ScaleTarget { target, ignore } = &image.scales[scale_index];
                        Ok((array4_to_tensor(target)?, array3_to_tensor(ignore)?))
                    })
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .unzip();

                Ok(ScaleTargetTensor {
                    target: Tensor::f_stack(&targets, 0)?.to_device(device),
                    ignore: Tensor::f_stack(&ignores, 0)?.to_device(device),
                })
            })
            .try_collect()?;

        Ok(Self { scales })
    }

    pub fn batch_size(&self) -> i64 {
        self.scales
            .first()
            .map(|scale| scale.target.size()[0])
            .unwrap_or(0)
    }
}

fn array4_to_tensor(array: &Array4<f32>) -> Result<Tensor> {
    let shape: Vec<i64> = array.shape().iter().map(|&dim| dim as i64).collect();
    let values: Vec<f32> = array.iter().cloned().collect();
    Ok(Tensor::of_slice(&values).f_view(shape.as_slice())?)
}

fn array3_to_tensor(array: &Array3<bool>) -> Result<Tensor> {
    let shape: Vec<i64> = array.shape().iter().map(|&dim| dim as i64).collect();
    let values: Vec<bool> = array.iter().cloned().collect();
    Ok(Tensor::of_slice(&values).f_view(shape.as_slice())?)
}

/// Converts ground truth boxes into dense targets and ignore masks.
#[derive(Debug, Clone)]
pub struct LabelGenerator {
    geometry: Arc<Geometry>,
}

impl LabelGenerator {
    pub fn new(geometry: Arc<Geometry>) -> Self {
        Self { geometry }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Encode the boxes of one image.
    ///
    /// When several boxes land on the same slot, the last one wins.
    pub fn generate(&self, labels: &[RatioLabel]) -> Result<ImageTarget> {
        let geometry = &*self.geometry;
        let num_classes = geometry.num_classes();
        let num_channels = geometry.num_channels();

        let mut scales: Vec<_> = geometry
            .scales()
            .iter()
            .map(|scale| {
                let shape = (
                    scale.grid_h(),
                    scale.grid_w(),
                    scale.anchors().len(),
                );
                ScaleTarget {
                    target: Array4::zeros((shape.0, shape.1, shape.2, num_channels)),
                    ignore: Array3::from_elem(shape, false),
                }
            })
            .collect();
        let mut collisions = 0;

        for label in labels {
            let [cy, cx, h, w] = label.cycxhw();
            ensure!(
                label.class < num_classes,
                "class id {} is out of range, the number of classes is {}",
                label.class,
                num_classes
            );
            ensure!(
                [cy, cx, h, w].iter().all(|value| value.is_finite()),
                "box coordinates must be finite, but get {:?}",
                label.rect
            );
            ensure!(
                (0.0..=1.0).contains(&cy.raw()) && (0.0..=1.0).contains(&cx.raw()),
                "box center must be within the image, but get {:?}",
                label.rect
            );

            let AnchorIndex {
                scale_index,
                anchor_index,
            } = geometry.best_anchor(&label.rect)?;
            let scale = &geometry.scales()[scale_index];
            let (row, col, y_offset, x_offset) = scale.locate(cy.raw(), cx.raw());

            let ScaleTarget { target, .. } = &mut scales[scale_index];
            let mut slot = target.slice_mut(s![row, col, anchor_index, ..]);

            if slot[channel::OBJECTNESS] == 1.0 {
                collisions += 1;
                debug!(
                    "box {:?} overwrites a previous box at scale {} cell ({}, {}) anchor {}",
                    label, scale_index, row, col, anchor_index
                );
            }

            slot.fill(0.0);
            slot[channel::X] = x_offset as f32;
            slot[channel::Y] = y_offset as f32;
            slot[channel::W] = w.raw() as f32;
            slot[channel::H] = h.raw() as f32;
            slot[channel::OBJECTNESS] = 1.0;
            slot[channel::CLASS_BEGIN + label.class] = 1.0;
        }

        self.mark_ignored(labels, &mut scales)?;

        Ok(ImageTarget { scales, collisions })
    }

    /// Encode a batch and stack the results into tensors.
    pub fn generate_batch<L>(&self, batch: &[L], device: Device) -> Result<BatchTargets>
    where
        L: Borrow<[RatioLabel]>,
    {
        let images: Vec<_> = batch
            .iter()
            .map(|labels| self.generate(labels.borrow()))
            .try_collect()?;
        BatchTargets::from_images(&images, device)
    }

    /// Mark unassigned slots whose anchor prior overlaps any ground truth box
    /// above the ignore threshold.
    fn mark_ignored(&self, labels: &[RatioLabel], scales: &mut [ScaleTarget]) -> Result<()> {
        let geometry = &*self.geometry;
        let thresh = geometry.ignore_iou_thresh();

        for label in labels {
            let [cy, cx, h, w] = label.cycxhw();

            for (scale, scale_target) in izip!(geometry.scales(), scales.iter_mut()) {
                for (anchor_index, anchor) in scale.anchors().iter().enumerate() {
                    let rows = scale.rows_near(cy.raw(), (h + anchor.h()).raw() / 2.0);
                    let cols = scale.cols_near(cx.raw(), (w + anchor.w()).raw() / 2.0);

                    for (row, col) in iproduct!(rows, cols.clone()) {
                        if scale_target.is_responsible(row, col, anchor_index)
                            || scale_target.ignore[[row, col, anchor_index]]
                        {
                            continue;
                        }

                        let prior = scale.prior_box(row, col, anchor_index)?;
                        if prior.try_iou_with(&label.rect)? > thresh {
                            scale_target.ignore[[row, col, anchor_index]] = true;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{GeometryInit, ScaleInit};

    fn generator() -> Result<LabelGenerator> {
        let geometry = GeometryInit::default_voc().build()?;
        Ok(LabelGenerator::new(Arc::new(geometry)))
    }

    fn count_objects(image: &ImageTarget) -> usize {
        image
            .scales
            .iter()
            .map(|scale| {
                scale
                    .target
                    .slice(s![.., .., .., channel::OBJECTNESS])
                    .iter()
                    .filter(|&&value| value == 1.0)
                    .count()
            })
            .sum()
    }

    #[test]
    fn empty_image_yields_zero_targets() -> Result<()> {
        let generator = generator()?;
        let image = generator.generate(&[])?;

        assert_eq!(image.scales.len(), 3);
        assert_eq!(image.collisions, 0);
        for (scale, grid) in izip!(&image.scales, [13, 26, 52]) {
            assert_eq!(scale.target.shape(), &[grid, grid, 3, 25]);
            assert!(scale.target.iter().all(|&value| value == 0.0));
            assert!(scale.ignore.iter().all(|&ignored| !ignored));
        }
        Ok(())
    }

    #[test]
    fn centered_box_scenario() -> Result<()> {
        let generator = generator()?;
        let label = RatioLabel::from_xywh(2, [0.5, 0.5, 0.1, 0.1])?;
        let image = generator.generate(&[label.clone()])?;

        // a 0.1x0.1 box matches the (62, 45)/416 anchor best, which is anchor 1 of scale 1
        let best = generator.geometry().best_anchor(&label.rect)?;
        assert_eq!(
            best,
            AnchorIndex {
                scale_index: 1,
                anchor_index: 1
            }
        );
        let scale = &image.scales[1];
        let slot = scale.target.slice(s![13, 13, 1, ..]);
        assert_abs_diff_eq!(slot[channel::X], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(slot[channel::Y], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(slot[channel::W], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(slot[channel::H], 0.1, epsilon = 1e-6);
        assert_eq!(slot[channel::OBJECTNESS], 1.0);
        for class in 0..20 {
            let expect = if class == 2 { 1.0 } else { 0.0 };
            assert_eq!(slot[channel::CLASS_BEGIN + class], expect);
        }

        // exactly one responsible slot over all scales, and no fractional objectness
        assert_eq!(count_objects(&image), 1);
        for scale in &image.scales {
            assert!(scale
                .target
                .slice(s![.., .., .., channel::OBJECTNESS])
                .iter()
                .all(|&value| value == 0.0 || value == 1.0));
        }

        // the responsible slot itself is never ignored
        assert!(!scale.ignore[[13, 13, 1]]);
        Ok(())
    }

    #[test]
    fn cell_center_offset_is_half() -> Result<()> {
        let generator = generator()?;
        // centered in cell (6, 6) of the 13x13 grid, shaped like its first anchor
        let label = RatioLabel::from_xywh(0, [6.5 / 13.0, 6.5 / 13.0, 116.0 / 416.0, 90.0 / 416.0])?;
        let image = generator.generate(&[label])?;

        let slot = image.scales[0].target.slice(s![6, 6, 0, ..]);
        assert_eq!(slot[channel::OBJECTNESS], 1.0);
        assert_abs_diff_eq!(slot[channel::X], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(slot[channel::Y], 0.5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn single_cell_grid_scenario() -> Result<()> {
        // one box against a 13x13 grid with the box at the exact image center
        let init = GeometryInit {
            input_size: [416, 416],
            num_classes: 3,
            scales: vec![
                ScaleInit {
                    stride: 32,
                    anchors: vec![
                        [r64(0.1), r64(0.1)],
                        [r64(0.3), r64(0.3)],
                        [r64(0.6), r64(0.6)],
                    ],
                },
                ScaleInit {
                    stride: 16,
                    anchors: vec![
                        [r64(0.05), r64(0.02)],
                        [r64(0.02), r64(0.05)],
                        [r64(0.04), r64(0.04)],
                    ],
                },
                ScaleInit {
                    stride: 8,
                    anchors: vec![
                        [r64(0.01), r64(0.01)],
                        [r64(0.02), r64(0.01)],
                        [r64(0.01), r64(0.02)],
                    ],
                },
            ],
            ignore_iou_thresh: r64(0.5),
        };
        let generator = LabelGenerator::new(Arc::new(init.build()?));
        let label = RatioLabel::from_xywh(2, [0.5, 0.5, 0.1, 0.1])?;
        let image = generator.generate(&[label])?;

        let scale = &image.scales[0];
        assert_eq!(scale.target[[6, 6, 0, channel::OBJECTNESS]], 1.0);
        assert_eq!(scale.target[[6, 6, 0, channel::CLASS_BEGIN + 2]], 1.0);
        assert_eq!(count_objects(&image), 1);

        // no prior overlaps the box above 0.5 IoU except the assigned one
        for scale in &image.scales {
            assert!(scale.ignore.iter().all(|&ignored| !ignored));
        }
        Ok(())
    }

    #[test]
    fn encoding_is_deterministic() -> Result<()> {
        let generator = generator()?;
        let labels = vec![
            RatioLabel::from_xywh(1, [0.21, 0.33, 0.05, 0.08])?,
            RatioLabel::from_xywh(4, [0.77, 0.41, 0.4, 0.3])?,
            RatioLabel::from_xywh(9, [0.5, 0.9, 0.12, 0.2])?,
        ];
        let first = generator.generate(&labels)?;
        let second = generator.generate(&labels)?;
        assert_eq!(first, second);
        assert_eq!(count_objects(&first), 3);
        Ok(())
    }

    #[test]
    fn colliding_boxes_last_write_wins() -> Result<()> {
        let generator = generator()?;
        // both boxes share a shape and a cell, thus the same slot
        let first = RatioLabel::from_xywh(3, [0.51, 0.52, 0.1, 0.1])?;
        let second = RatioLabel::from_xywh(7, [0.53, 0.50, 0.1, 0.1])?;
        let image = generator.generate(&[first, second])?;

        assert_eq!(image.collisions, 1);
        assert_eq!(count_objects(&image), 1);

        let slot = image.scales[1].target.slice(s![13, 13, 1, ..]);
        assert_abs_diff_eq!(slot[channel::X], (0.53 * 26.0 - 13.0) as f32, epsilon = 1e-5);
        assert_abs_diff_eq!(slot[channel::Y], (0.50 * 26.0 - 13.0) as f32, epsilon = 1e-5);
        assert_eq!(slot[channel::CLASS_BEGIN + 7], 1.0);
        assert_eq!(slot[channel::CLASS_BEGIN + 3], 0.0);
        Ok(())
    }

    #[test]
    fn large_box_marks_ignored_priors() -> Result<()> {
        let generator = generator()?;
        // shaped like anchor 1 of scale 0, so the neighbor cells' priors overlap strongly
        let label = RatioLabel::from_xywh(0, [0.5, 0.5, 156.0 / 416.0, 198.0 / 416.0])?;
        let image = generator.generate(&[label])?;

        let scale = &image.scales[0];
        assert!(scale.is_responsible(6, 6, 1));
        assert!(!scale.ignore[[6, 6, 1]]);
        assert!(scale.ignore[[6, 7, 1]]);
        assert!(scale.ignore[[5, 6, 1]]);
        // far away cells never overlap
        assert!(!scale.ignore[[0, 0, 1]]);
        assert!(!scale.ignore[[12, 12, 1]]);
        Ok(())
    }

    #[test]
    fn reject_invalid_boxes() -> Result<()> {
        let generator = generator()?;
        let bad_class = RatioLabel::from_xywh(20, [0.5, 0.5, 0.1, 0.1])?;
        assert!(generator.generate(&[bad_class]).is_err());

        let outside = RatioLabel::from_xywh(0, [1.5, 0.5, 0.1, 0.1])?;
        assert!(generator.generate(&[outside]).is_err());
        Ok(())
    }

    #[test]
    fn zero_sized_box_is_encoded() -> Result<()> {
        let generator = generator()?;
        let label = RatioLabel::from_xywh(0, [0.5, 0.5, 0.0, 0.0])?;
        let image = generator.generate(&[label])?;

        // all IoUs are zero, so the first anchor is chosen
        let slot = image.scales[0].target.slice(s![6, 6, 0, ..]);
        assert_eq!(slot[channel::OBJECTNESS], 1.0);
        assert_eq!(slot[channel::W], 0.0);
        Ok(())
    }

    #[test]
    fn batch_tensors_have_expected_shapes() -> Result<()> {
        let generator = generator()?;
        let batch = vec![
            vec![RatioLabel::from_xywh(2, [0.5, 0.5, 0.1, 0.1])?],
            vec![],
        ];
        let targets = generator.generate_batch(&batch, Device::Cpu)?;

        assert_eq!(targets.batch_size(), 2);
        let shapes: Vec<_> = targets
            .scales
            .iter()
            .map(|scale| (scale.target.size(), scale.ignore.size()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                (vec![2, 13, 13, 3, 25], vec![2, 13, 13, 3]),
                (vec![2, 26, 26, 3, 25], vec![2, 26, 26, 3]),
                (vec![2, 52, 52, 3, 25], vec![2, 52, 52, 3]),
            ]
        );
        assert_eq!(targets.scales[1].ignore.kind(), Kind::Bool);

        let objectness = targets.scales[1]
            .target
            .i((.., .., .., .., channel::OBJECTNESS as i64));
        assert_abs_diff_eq!(f64::from(objectness.sum(Kind::Float)), 1.0);
        assert_abs_diff_eq!(
            f64::from(targets.scales[1].target.i((0, 13, 13, 1, 4))),
            1.0
        );
        Ok(())
    }
}
