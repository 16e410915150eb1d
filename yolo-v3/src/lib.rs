//! YOLOv3 label generation, detection loss and the network.

mod common;
pub mod geometry;
pub mod inference;
pub mod label;
pub mod loss;
pub mod model;
