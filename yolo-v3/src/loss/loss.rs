//! Defines loss for training.

use super::{
    bce_loss::{BceLoss, BceLossInit},
    cross_entropy::CrossEntropyLoss,
    iou::pairwise_iou,
    misc::ClassificationLossKind,
};
use crate::{
    common::*,
    geometry::{channel, Geometry, Scale, NUM_SCALES},
    label::{BatchTargets, ScaleTargetTensor},
};

pub use yolo_loss::*;
pub use yolo_loss_output::*;

mod yolo_loss {
    use super::*;

    #[derive(Debug, Clone, Default)]
    pub struct YoloLossInit {
        pub localization_weight: Option<f64>,
        pub objectness_weight: Option<f64>,
        pub no_object_weight: Option<f64>,
        pub classification_weight: Option<f64>,
        /// Extra localization weight for small boxes, scaled by `1 - w * h`.
        pub small_box_weight: Option<f64>,
        pub classification_loss_kind: Option<ClassificationLossKind>,
        /// Also ignore no-object slots whose predicted box overlaps a ground truth.
        pub ignore_from_predictions: Option<bool>,
        pub eps: Option<f64>,
    }

    impl YoloLossInit {
        pub fn build(self, geometry: Arc<Geometry>) -> Result<YoloLoss> {
            let Self {
                localization_weight,
                objectness_weight,
                no_object_weight,
                classification_weight,
                small_box_weight,
                classification_loss_kind,
                ignore_from_predictions,
                eps,
            } = self;

            let localization_weight = localization_weight.unwrap_or(1.0);
            let objectness_weight = objectness_weight.unwrap_or(1.0);
            let no_object_weight = no_object_weight.unwrap_or(1.0);
            let classification_weight = classification_weight.unwrap_or(1.0);
            let small_box_weight = small_box_weight.unwrap_or(1.0);
            let classification_loss_kind = classification_loss_kind.unwrap_or_default();
            let ignore_from_predictions = ignore_from_predictions.unwrap_or(false);
            let eps = eps.unwrap_or(1e-7);

            for (name, value) in [
                ("localization_weight", localization_weight),
                ("objectness_weight", objectness_weight),
                ("no_object_weight", no_object_weight),
                ("classification_weight", classification_weight),
                ("small_box_weight", small_box_weight),
            ] {
                ensure!(
                    value.is_finite() && value >= 0.0,
                    "{} must be finite and non-negative, but get {}",
                    name,
                    value
                );
            }

            let bce = BceLossInit { eps }.build()?;

            Ok(YoloLoss {
                geometry,
                localization_weight,
                objectness_weight,
                no_object_weight,
                classification_weight,
                small_box_weight,
                classification_loss_kind,
                ignore_from_predictions,
                bce,
                cross_entropy: CrossEntropyLoss::new(),
            })
        }
    }

    #[derive(Debug)]
    pub struct YoloLoss {
        geometry: Arc<Geometry>,
        localization_weight: f64,
        objectness_weight: f64,
        no_object_weight: f64,
        classification_weight: f64,
        small_box_weight: f64,
        classification_loss_kind: ClassificationLossKind,
        ignore_from_predictions: bool,
        bce: BceLoss,
        cross_entropy: CrossEntropyLoss,
    }

    /// Unnormalized loss terms of one scale.
    #[derive(Debug)]
    struct ScaleLoss {
        localization: Tensor,
        objectness: Tensor,
        no_object: Tensor,
        classification: Tensor,
    }

    impl YoloLoss {
        pub fn geometry(&self) -> &Geometry {
            &self.geometry
        }

        /// Compute the loss of raw network outputs against encoded targets.
        ///
        /// `predictions` holds one `[batch, grid_h, grid_w, anchors, 5 + num_classes]`
        /// tensor per scale, ordered like the geometry scales.
        pub fn forward(
            &self,
            predictions: &[Tensor],
            targets: &BatchTargets,
        ) -> Result<YoloLossOutput> {
            let geometry = &*self.geometry;
            ensure!(
                predictions.len() == NUM_SCALES,
                "expect {} prediction tensors, but get {}",
                NUM_SCALES,
                predictions.len()
            );
            ensure!(
                targets.scales.len() == NUM_SCALES,
                "expect targets of {} scales, but get {}",
                NUM_SCALES,
                targets.scales.len()
            );

            let batch_size = predictions[0].size().first().cloned().unwrap_or(0);
            ensure!(batch_size > 0, "the batch must not be empty");

            for (scale_index, (scale, prediction, target)) in
                izip!(geometry.scales(), predictions, &targets.scales).enumerate()
            {
                self.check_shapes(scale_index, scale, batch_size, prediction, target)?;
            }

            let gt_boxes = if self.ignore_from_predictions {
                Some(tch::no_grad(|| self.ground_truth_boxes(targets, batch_size))?)
            } else {
                None
            };

            let scale_losses: Vec<_> = izip!(geometry.scales(), predictions, &targets.scales)
                .map(|(scale, prediction, target)| {
                    self.scale_loss(scale, prediction, target, gt_boxes.as_deref())
                })
                .try_collect()?;

            let sum_terms = |select: fn(&ScaleLoss) -> &Tensor| -> Result<Tensor> {
                let sum = Tensor::f_sum_tensors(scale_losses.iter().map(select))?;
                Ok(sum / batch_size as f64)
            };
            let localization_loss = sum_terms(|loss| &loss.localization)?;
            let objectness_loss = sum_terms(|loss| &loss.objectness)?;
            let no_object_loss = sum_terms(|loss| &loss.no_object)?;
            let classification_loss = sum_terms(|loss| &loss.classification)?;

            let total_loss = self.localization_weight * &localization_loss
                + self.objectness_weight * &objectness_loss
                + self.no_object_weight * &no_object_loss
                + self.classification_weight * &classification_loss;
            debug_assert!(!bool::from(total_loss.isnan().any()), "NaN detected");

            Ok(YoloLossOutput {
                total_loss,
                localization_loss,
                objectness_loss,
                no_object_loss,
                classification_loss,
            })
        }

        fn check_shapes(
            &self,
            scale_index: usize,
            scale: &Scale,
            batch_size: i64,
            prediction: &Tensor,
            target: &ScaleTargetTensor,
        ) -> Result<()> {
            let expect_target = vec![
                batch_size,
                scale.grid_h() as i64,
                scale.grid_w() as i64,
                scale.anchors().len() as i64,
                self.geometry.num_channels() as i64,
            ];
            let expect_ignore = expect_target[0..4].to_vec();

            ensure!(
                prediction.size() == expect_target,
                "prediction shape mismatch at scale {}: expect {:?}, but get {:?}",
                scale_index,
                expect_target,
                prediction.size()
            );
            ensure!(
                target.target.size() == expect_target,
                "target shape mismatch at scale {}: expect {:?}, but get {:?}",
                scale_index,
                expect_target,
                target.target.size()
            );
            ensure!(
                target.ignore.size() == expect_ignore,
                "ignore mask shape mismatch at scale {}: expect {:?}, but get {:?}",
                scale_index,
                expect_ignore,
                target.ignore.size()
            );
            ensure!(
                target.ignore.kind() == Kind::Bool,
                "ignore mask must be a bool tensor, but get {:?}",
                target.ignore.kind()
            );
            Ok(())
        }

        fn scale_loss(
            &self,
            scale: &Scale,
            prediction: &Tensor,
            target: &ScaleTargetTensor,
            gt_boxes: Option<&[Tensor]>,
        ) -> Result<ScaleLoss> {
            let device = prediction.device();
            let target_tensor = target.target.to_device(device);
            let channels = |tensor: &Tensor, range: Range<usize>| {
                tensor.i((.., .., .., .., range.start as i64..range.end as i64))
            };
            let num_channels = self.geometry.num_channels();

            let pred_xy = channels(prediction, channel::X..channel::Y + 1).sigmoid();
            let pred_wh = channels(prediction, channel::W..channel::H + 1);
            let pred_obj = prediction.select(-1, channel::OBJECTNESS as i64).sigmoid();
            let pred_class = channels(prediction, channel::CLASS_BEGIN..num_channels);

            let target_xy = channels(&target_tensor, channel::X..channel::Y + 1);
            let target_wh = channels(&target_tensor, channel::W..channel::H + 1);
            let target_obj = target_tensor.select(-1, channel::OBJECTNESS as i64);
            let target_class = channels(&target_tensor, channel::CLASS_BEGIN..num_channels);

            let obj_mask = target_obj.eq(1.0);
            let ignore_mask = {
                let ignore = target.ignore.to_device(device);
                match gt_boxes {
                    Some(gt_boxes) => {
                        let predicted = tch::no_grad(|| {
                            self.prediction_ignore(scale, &pred_xy, &pred_wh, gt_boxes)
                        })?;
                        ignore.logical_or(&predicted)
                    }
                    None => ignore,
                }
            };
            let no_obj_mask = obj_mask
                .logical_not()
                .logical_and(&ignore_mask.logical_not())
                .to_kind(Kind::Float);
            let obj_mask = obj_mask.to_kind(Kind::Float);

            // localization
            let localization = {
                let target_area = target_wh.select(-1, 0) * target_wh.select(-1, 1);
                let box_weight: Tensor = 1.0 + self.small_box_weight * (1.0 - target_area);
                let squared_error = (&pred_xy - &target_xy).square().sum_dim_intlist(
                    &[-1],
                    false,
                    Kind::Float,
                ) + (&pred_wh - &target_wh).square().sum_dim_intlist(
                    &[-1],
                    false,
                    Kind::Float,
                );
                (squared_error * box_weight * &obj_mask).sum(Kind::Float)
            };

            // objectness and no-object
            let obj_bce = self.bce.forward(&pred_obj, &target_obj);
            let objectness = (&obj_bce * &obj_mask).sum(Kind::Float);
            let no_object = (&obj_bce * &no_obj_mask).sum(Kind::Float);

            // classification
            let classification = {
                let loss = match self.classification_loss_kind {
                    ClassificationLossKind::Bce => self
                        .bce
                        .forward(&pred_class.sigmoid(), &target_class)
                        .sum_dim_intlist(&[-1], false, Kind::Float),
                    ClassificationLossKind::CrossEntropy => {
                        self.cross_entropy.forward(&pred_class, &target_class)
                    }
                };
                (loss * &obj_mask).sum(Kind::Float)
            };

            Ok(ScaleLoss {
                localization,
                objectness,
                no_object,
                classification,
            })
        }

        /// Collect ground truth boxes of each image from the responsible slots,
        /// as `[n, 4]` tensors in `[cy, cx, h, w]` ratio units.
        fn ground_truth_boxes(&self, targets: &BatchTargets, batch_size: i64) -> Result<Vec<Tensor>> {
            let per_scale: Vec<_> = izip!(self.geometry.scales(), &targets.scales)
                .map(|(scale, target)| -> Result<_> {
                    let target = &target.target;
                    let xy = target.i((.., .., .., .., channel::X as i64..channel::Y as i64 + 1));
                    let wh = target.i((.., .., .., .., channel::W as i64..channel::H as i64 + 1));
                    let boxes = scale.decode_boxes(&xy, &wh)?;
                    let mask = target.select(-1, channel::OBJECTNESS as i64).eq(1.0);
                    Ok((boxes, mask))
                })
                .try_collect()?;

            let gt_boxes: Vec<_> = (0..batch_size)
                .map(|batch_index| {
                    let boxes: Vec<_> = per_scale
                        .iter()
                        .map(|(boxes, mask)| {
                            boxes
                                .i(batch_index)
                                .masked_select(&mask.i(batch_index).unsqueeze(-1))
                                .view([-1, 4])
                        })
                        .collect();
                    Tensor::cat(&boxes, 0)
                })
                .collect();

            Ok(gt_boxes)
        }

        /// Slots whose predicted box overlaps any ground truth of the same image
        /// above the ignore threshold.
        fn prediction_ignore(
            &self,
            scale: &Scale,
            pred_xy: &Tensor,
            pred_wh: &Tensor,
            gt_boxes: &[Tensor],
        ) -> Result<Tensor> {
            let thresh = self.geometry.ignore_iou_thresh().raw();
            let pred_boxes = scale.decode_boxes(pred_xy, &pred_wh.clamp_min(0.0))?;
            let slot_shape = pred_boxes.size()[1..4].to_vec();

            let masks: Vec<_> = gt_boxes
                .iter()
                .enumerate()
                .map(|(batch_index, gt)| -> Result<_> {
                    let device = pred_boxes.device();
                    if gt.is_empty() {
                        return Ok(Tensor::zeros(&slot_shape, (Kind::Bool, device)));
                    }
                    let pred = pred_boxes.i(batch_index as i64).reshape(&[-1, 4]);
                    let iou = pairwise_iou(&pred, &gt.to_device(device))?;
                    let mask = iou.amax(&[1], false).gt(thresh).view(slot_shape.as_slice());
                    Ok(mask)
                })
                .try_collect()?;

            Ok(Tensor::stack(&masks, 0))
        }
    }
}

mod yolo_loss_output {
    use super::*;

    /// The weighted total and the unweighted terms, normalized by batch size.
    #[derive(Debug, TensorLike)]
    pub struct YoloLossOutput {
        pub total_loss: Tensor,
        pub localization_loss: Tensor,
        pub objectness_loss: Tensor,
        pub no_object_loss: Tensor,
        pub classification_loss: Tensor,
    }
}
