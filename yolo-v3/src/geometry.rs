//! Detection scales, anchor priors and the grid geometry shared by the
//! label generator, the loss function and the decoder.

use crate::common::*;

/// The number of detection scales.
pub const NUM_SCALES: usize = 3;
/// The number of anchors on each scale.
pub const ANCHORS_PER_SCALE: usize = 3;

/// The largest cell offset, kept below 1 after the cast to `f32` targets.
const MAX_CELL_OFFSET: f64 = 1.0 - f32::EPSILON as f64;

/// Channel indexes of target and prediction tensors.
///
/// The last dimension of both tensors is laid out as
/// `[x_offset, y_offset, width, height, objectness, class...]`.
pub mod channel {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const W: usize = 2;
    pub const H: usize = 3;
    pub const OBJECTNESS: usize = 4;
    pub const CLASS_BEGIN: usize = 5;
}

/// Options of a detection scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleInit {
    /// The number of input pixels covered by one grid cell.
    pub stride: usize,
    /// Anchor sizes in `[width, height]` ratio units.
    pub anchors: Vec<[R64; 2]>,
}

/// The geometry initializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryInit {
    /// Input image size in `[height, width]` pixels.
    pub input_size: [usize; 2],
    pub num_classes: usize,
    /// Detection scales ordered from the coarsest grid to the finest.
    pub scales: Vec<ScaleInit>,
    /// Unassigned slots overlapping a ground truth above this IoU are excluded
    /// from the no-object loss.
    pub ignore_iou_thresh: R64,
}

impl GeometryInit {
    /// The stock 416x416 configuration with 20 classes and the COCO anchors.
    pub fn default_voc() -> Self {
        let anchor = |w: f64, h: f64| [r64(w / 416.0), r64(h / 416.0)];

        Self {
            input_size: [416, 416],
            num_classes: 20,
            scales: vec![
                ScaleInit {
                    stride: 32,
                    anchors: vec![
                        anchor(116.0, 90.0),
                        anchor(156.0, 198.0),
                        anchor(373.0, 326.0),
                    ],
                },
                ScaleInit {
                    stride: 16,
                    anchors: vec![
                        anchor(30.0, 61.0),
                        anchor(62.0, 45.0),
                        anchor(59.0, 119.0),
                    ],
                },
                ScaleInit {
                    stride: 8,
                    anchors: vec![
                        anchor(10.0, 13.0),
                        anchor(16.0, 30.0),
                        anchor(33.0, 23.0),
                    ],
                },
            ],
            ignore_iou_thresh: r64(0.5),
        }
    }

    pub fn build(self) -> Result<Geometry> {
        let Self {
            input_size: [input_h, input_w],
            num_classes,
            scales,
            ignore_iou_thresh,
        } = self;

        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            input_h > 0 && input_w > 0,
            "input size must be positive, but get {}x{}",
            input_h,
            input_w
        );
        ensure!(
            ignore_iou_thresh > 0.0 && ignore_iou_thresh <= 1.0,
            "ignore_iou_thresh must be in range (0, 1], but get {}",
            ignore_iou_thresh
        );
        ensure!(
            scales.len() == NUM_SCALES,
            "expect exactly {} scales, but get {}",
            NUM_SCALES,
            scales.len()
        );
        ensure!(
            scales
                .iter()
                .tuple_windows()
                .all(|(prev, next)| prev.stride > next.stride),
            "strides must be strictly decreasing, but get {:?}",
            scales.iter().map(|scale| scale.stride).collect::<Vec<_>>()
        );

        let scales: Vec<_> = scales
            .into_iter()
            .enumerate()
            .map(|(scale_index, init)| -> Result<_> {
                let ScaleInit { stride, anchors } = init;

                ensure!(stride > 0, "stride of scale {} must be positive", scale_index);
                ensure!(
                    input_h % stride == 0 && input_w % stride == 0,
                    "input size {}x{} is not divisible by stride {} of scale {}",
                    input_h,
                    input_w,
                    stride,
                    scale_index
                );
                ensure!(
                    anchors.len() == ANCHORS_PER_SCALE,
                    "expect exactly {} anchors on scale {}, but get {}",
                    ANCHORS_PER_SCALE,
                    scale_index,
                    anchors.len()
                );

                let anchors: Vec<_> = anchors
                    .into_iter()
                    .map(|[w, h]| -> Result<_> {
                        ensure!(
                            w.is_finite() && h.is_finite() && w > 0.0 && h > 0.0,
                            "anchor size must be finite and positive, but get [{}, {}] on scale {}",
                            w,
                            h,
                            scale_index
                        );
                        HW::try_from_hw([h, w])
                    })
                    .try_collect()?;

                Ok(Scale {
                    stride,
                    grid_h: input_h / stride,
                    grid_w: input_w / stride,
                    anchors,
                })
            })
            .try_collect()?;

        Ok(Geometry {
            input_h,
            input_w,
            num_classes,
            scales,
            ignore_iou_thresh,
        })
    }
}

/// A detection scale with its derived grid size.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct Scale {
    #[get_copy = "pub"]
    stride: usize,
    #[get_copy = "pub"]
    grid_h: usize,
    #[get_copy = "pub"]
    grid_w: usize,
    #[get = "pub"]
    anchors: Vec<HW<R64>>,
}

impl Scale {
    /// Locate the grid cell containing a point in ratio units.
    ///
    /// Returns `(row, col, y_offset, x_offset)` with offsets in `[0, 1)`. A point
    /// on the far image edge is clamped into the last cell, just below its far side.
    pub fn locate(&self, cy: f64, cx: f64) -> (usize, usize, f64, f64) {
        let grid_y = cy * self.grid_h as f64;
        let grid_x = cx * self.grid_w as f64;
        let row = (grid_y.floor().max(0.0) as usize).min(self.grid_h - 1);
        let col = (grid_x.floor().max(0.0) as usize).min(self.grid_w - 1);
        let y_offset = (grid_y - row as f64).min(MAX_CELL_OFFSET);
        let x_offset = (grid_x - col as f64).min(MAX_CELL_OFFSET);
        (row, col, y_offset, x_offset)
    }

    /// The anchor prior centered in the given cell, in ratio units.
    pub fn prior_box(&self, row: usize, col: usize, anchor_index: usize) -> Result<CyCxHW<R64>> {
        let anchor = self
            .anchors
            .get(anchor_index)
            .ok_or_else(|| format_err!("anchor index {} is out of range", anchor_index))?;
        let cy = (row as f64 + 0.5) / self.grid_h as f64;
        let cx = (col as f64 + 0.5) / self.grid_w as f64;
        CyCxHW::try_from_cycxhw([r64(cy), r64(cx), anchor.h(), anchor.w()])
    }

    /// Decode cell offsets and box sizes into ratio boxes.
    ///
    /// `offsets` is a `[batch, grid_h, grid_w, anchors, 2]` tensor in `[x, y]`
    /// order and `sizes` has the same shape in `[w, h]` order. The output is
    /// in `[cy, cx, h, w]` order.
    pub fn decode_boxes(&self, offsets: &Tensor, sizes: &Tensor) -> Result<Tensor> {
        let expect_shape = |tensor: &Tensor| -> Result<()> {
            match *tensor.size().as_slice() {
                [_, grid_h, grid_w, _, 2]
                    if grid_h == self.grid_h as i64 && grid_w == self.grid_w as i64 =>
                {
                    Ok(())
                }
                ref shape => bail!(
                    "expect a [batch, {}, {}, anchors, 2] tensor, but get {:?}",
                    self.grid_h,
                    self.grid_w,
                    shape
                ),
            }
        };
        expect_shape(offsets)?;
        expect_shape(sizes)?;

        let device = offsets.device();
        let grid_h = self.grid_h as i64;
        let grid_w = self.grid_w as i64;
        let rows = Tensor::arange(grid_h, (Kind::Float, device)).view([grid_h, 1, 1]);
        let cols = Tensor::arange(grid_w, (Kind::Float, device)).view([grid_w, 1]);

        let cx = (offsets.select(-1, 0) + cols) / grid_w as f64;
        let cy = (offsets.select(-1, 1) + rows) / grid_h as f64;
        let w = sizes.select(-1, 0);
        let h = sizes.select(-1, 1);

        Ok(Tensor::stack(&[cy, cx, h, w], -1))
    }

    /// Rows whose cell centers lie within `half_extent` of `center`.
    pub fn rows_near(&self, center: f64, half_extent: f64) -> Range<usize> {
        span_near(center, half_extent, self.grid_h)
    }

    /// Columns whose cell centers lie within `half_extent` of `center`.
    pub fn cols_near(&self, center: f64, half_extent: f64) -> Range<usize> {
        span_near(center, half_extent, self.grid_w)
    }
}

fn span_near(center: f64, half_extent: f64, grid: usize) -> Range<usize> {
    let grid_f = grid as f64;
    let lower = ((center - half_extent) * grid_f - 0.5).ceil().max(0.0);
    let upper = ((center + half_extent) * grid_f - 0.5).floor() + 1.0;
    let upper = upper.max(lower).min(grid_f);
    (lower.min(grid_f) as usize)..(upper as usize)
}

/// Identifies an anchor among all scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnchorIndex {
    pub scale_index: usize,
    pub anchor_index: usize,
}

/// The immutable detection geometry.
#[derive(Debug, Clone, PartialEq, Getters, CopyGetters)]
pub struct Geometry {
    #[get_copy = "pub"]
    input_h: usize,
    #[get_copy = "pub"]
    input_w: usize,
    #[get_copy = "pub"]
    num_classes: usize,
    #[get = "pub"]
    scales: Vec<Scale>,
    #[get_copy = "pub"]
    ignore_iou_thresh: R64,
}

impl Geometry {
    /// The number of channels per anchor slot, that is `5 + num_classes`.
    pub fn num_channels(&self) -> usize {
        channel::CLASS_BEGIN + self.num_classes
    }

    /// The number of anchors over all scales.
    pub fn num_anchors(&self) -> usize {
        self.scales.iter().map(|scale| scale.anchors.len()).sum()
    }

    /// Iterate anchors in `(scale, anchor)` order.
    pub fn anchors(&self) -> impl Iterator<Item = (AnchorIndex, &HW<R64>)> + '_ {
        self.scales
            .iter()
            .enumerate()
            .flat_map(|(scale_index, scale)| {
                scale
                    .anchors
                    .iter()
                    .enumerate()
                    .map(move |(anchor_index, anchor)| {
                        let index = AnchorIndex {
                            scale_index,
                            anchor_index,
                        };
                        (index, anchor)
                    })
            })
    }

    /// Shape-only IoU of a box against every anchor, in `(scale, anchor)` order.
    pub fn anchor_ious<R>(&self, rect: &R) -> Result<Vec<(AnchorIndex, R64)>>
    where
        R: Rect<Type = R64>,
    {
        let size = HW::try_from_hw([rect.h(), rect.w()])?;
        self.anchors()
            .map(|(index, anchor)| -> Result<_> {
                Ok((index, size.try_centered_iou_with(anchor)?))
            })
            .try_collect()
    }

    /// The anchor having the largest IoU with the box.
    ///
    /// Ties are resolved to the first anchor in `(scale, anchor)` order.
    pub fn best_anchor<R>(&self, rect: &R) -> Result<AnchorIndex>
    where
        R: Rect<Type = R64>,
    {
        let ious = self.anchor_ious(rect)?;
        let (best_index, _) = ious
            .into_iter()
            .fold(None, |best: Option<(AnchorIndex, R64)>, (index, iou)| match best {
                Some((_, best_iou)) if iou <= best_iou => best,
                _ => Some((index, iou)),
            })
            .ok_or_else(|| format_err!("no anchors are configured"))?;
        Ok(best_index)
    }
}
