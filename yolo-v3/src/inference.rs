//! Decoding raw network outputs into scored detections.

use crate::{
    common::*,
    geometry::{channel, Geometry, NUM_SCALES},
};

#[derive(Debug, Clone)]
pub struct YoloInferenceInit {
    /// Detections scoring at or below this value are dropped.
    pub confidence_thresh: R64,
}

impl YoloInferenceInit {
    pub fn build(self, geometry: Arc<Geometry>) -> Result<YoloInference> {
        let Self { confidence_thresh } = self;
        ensure!(
            (0.0..1.0).contains(&confidence_thresh.raw()),
            "confidence_thresh must be in range [0, 1), but get {}",
            confidence_thresh
        );
        Ok(YoloInference {
            geometry,
            confidence_thresh,
        })
    }
}

/// A decoded detection in ratio units.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub rect: CyCxHW<R64>,
    pub class: usize,
    pub score: R64,
}

#[derive(Debug)]
pub struct YoloInference {
    geometry: Arc<Geometry>,
    confidence_thresh: R64,
}

impl YoloInference {
    /// Decode detections of each image, sorted by descending score.
    ///
    /// No suppression is applied.
    pub fn forward(&self, predictions: &[Tensor]) -> Result<Vec<Vec<Detection>>> {
        let geometry = &*self.geometry;
        ensure!(
            predictions.len() == NUM_SCALES,
            "expect {} prediction tensors, but get {}",
            NUM_SCALES,
            predictions.len()
        );
        let batch_size = predictions[0].size().first().cloned().unwrap_or(0);
        let num_classes = geometry.num_classes() as i64;
        let num_channels = geometry.num_channels() as i64;

        // decode to [batch, slots, 4 + 1 + 1] as (cy, cx, h, w, score, class)
        let decoded: Vec<_> = tch::no_grad(|| {
            izip!(geometry.scales(), predictions)
                .map(|(scale, prediction)| -> Result<_> {
                    let prediction = prediction.to_device(Device::Cpu).to_kind(Kind::Float);
                    let expect = [
                        batch_size,
                        scale.grid_h() as i64,
                        scale.grid_w() as i64,
                        scale.anchors().len() as i64,
                        num_channels,
                    ];
                    ensure!(
                        prediction.size() == expect,
                        "expect prediction shape {:?}, but get {:?}",
                        expect,
                        prediction.size()
                    );

                    let xy = prediction
                        .i((.., .., .., .., channel::X as i64..channel::Y as i64 + 1))
                        .sigmoid();
                    let wh = prediction
                        .i((.., .., .., .., channel::W as i64..channel::H as i64 + 1))
                        .clamp_min(0.0);
                    let boxes = scale.decode_boxes(&xy, &wh)?;

                    let objectness = prediction.select(-1, channel::OBJECTNESS as i64).sigmoid();
                    let class_prob = prediction
                        .i((
                            ..,
                            ..,
                            ..,
                            ..,
                            channel::CLASS_BEGIN as i64..channel::CLASS_BEGIN as i64 + num_classes,
                        ))
                        .sigmoid();
                    let (max_prob, class) = class_prob.max_dim(-1, false);
                    let score = objectness * max_prob;

                    let output = Tensor::cat(
                        &[
                            boxes,
                            score.unsqueeze(-1),
                            class.to_kind(Kind::Float).unsqueeze(-1),
                        ],
                        -1,
                    )
                    .view([batch_size, -1, 6]);
                    Ok(output)
                })
                .try_collect()
        })?;
        let decoded = Tensor::cat(&decoded, 1);

        (0..batch_size)
            .map(|batch_index| self.collect_detections(&decoded.i(batch_index)))
            .try_collect()
    }

    fn collect_detections(&self, decoded: &Tensor) -> Result<Vec<Detection>> {
        let thresh = self.confidence_thresh.raw();
        let keep = decoded.i((.., 4)).gt(thresh);
        let selected = decoded.index_select(0, &keep.nonzero().view([-1]));
        let num_selected = selected.size2()?.0 as usize;
        let values: Vec<f32> = Vec::from(&selected.view([-1]));

        let mut detections: Vec<_> = values
            .chunks(6)
            .take(num_selected)
            .map(|row| -> Result<_> {
                let [cy, cx, h, w, score, class] = [
                    row[0] as f64,
                    row[1] as f64,
                    row[2] as f64,
                    row[3] as f64,
                    row[4] as f64,
                    row[5] as f64,
                ];
                ensure!(
                    [cy, cx, h, w, score].iter().all(|value| value.is_finite()),
                    "non-finite prediction detected"
                );
                let rect = CyCxHW::try_from_cycxhw([r64(cy), r64(cx), r64(h), r64(w)])?;
                Ok(Detection {
                    rect,
                    class: class as usize,
                    score: r64(score),
                })
            })
            .try_collect()?;

        detections.sort_by(|lhs, rhs| rhs.score.cmp(&lhs.score));
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::GeometryInit;

    #[test]
    fn decode_confident_slots() -> Result<()> {
        let geometry = Arc::new(GeometryInit::default_voc().build()?);
        let predictions: Vec<_> = geometry
            .scales()
            .iter()
            .map(|scale| {
                Tensor::full(
                    &[
                        2,
                        scale.grid_h() as i64,
                        scale.grid_w() as i64,
                        scale.anchors().len() as i64,
                        geometry.num_channels() as i64,
                    ],
                    -20.0,
                    FLOAT_CPU,
                )
            })
            .collect();

        // a confident class-4 box at cell (6, 6) of the coarsest scale in image 1
        let slot = predictions[0].i((1, 6, 6, 2));
        let _ = slot.i(0..2).fill_(0.0);
        let _ = slot.i(2..4).fill_(0.25);
        let _ = slot.i(4).fill_(20.0);
        let _ = slot.i(9).fill_(20.0);
        // a weaker box at the finest scale
        let slot = predictions[2].i((1, 10, 40, 0));
        let _ = slot.i(0..2).fill_(0.0);
        let _ = slot.i(2..4).fill_(0.05);
        let _ = slot.i(4).fill_(1.0);
        let _ = slot.i(5).fill_(2.0);

        let inference = YoloInferenceInit {
            confidence_thresh: r64(0.5),
        }
        .build(geometry)?;
        let detections = inference.forward(&predictions)?;

        assert_eq!(detections.len(), 2);
        assert!(detections[0].is_empty());
        assert_eq!(detections[1].len(), 2);

        let first = &detections[1][0];
        assert_eq!(first.class, 4);
        let [cy, cx, h, w] = first.rect.cycxhw();
        assert_abs_diff_eq!(cy.raw(), 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(cx.raw(), 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(h.raw(), 0.25, epsilon = 1e-5);
        assert_abs_diff_eq!(w.raw(), 0.25, epsilon = 1e-5);

        let second = &detections[1][1];
        assert_eq!(second.class, 0);
        assert!(second.score < first.score);
        assert_abs_diff_eq!(second.rect.cy().raw(), 10.5 / 52.0, epsilon = 1e-5);
        assert_abs_diff_eq!(second.rect.cx().raw(), 40.5 / 52.0, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn reject_bad_thresh() -> Result<()> {
        let geometry = Arc::new(GeometryInit::default_voc().build()?);
        let init = YoloInferenceInit {
            confidence_thresh: r64(1.0),
        };
        assert!(init.build(geometry).is_err());
        Ok(())
    }
}
