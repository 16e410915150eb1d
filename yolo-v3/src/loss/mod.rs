//! Loss function building blocks.

mod bce_loss;
mod cross_entropy;
mod iou;
mod loss;
mod misc;

pub use bce_loss::*;
pub use cross_entropy::*;
pub use iou::*;
pub use loss::*;
pub use misc::*;
