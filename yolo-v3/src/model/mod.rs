//! Detection networks.

mod yolo_v3;

pub use yolo_v3::*;

use crate::common::*;

/// A network producing one raw output tensor per detection scale.
///
/// Each output is shaped `[batch, grid_h, grid_w, anchors, 5 + num_classes]`,
/// ordered from the coarsest grid to the finest.
pub trait DetectionModel {
    fn forward_t(&mut self, input: &Tensor, train: bool) -> Result<Vec<Tensor>>;
}
