//! Tensor utilities and network building blocks on top of tch.

mod common;
pub mod activation;
pub mod module;
pub mod tensor;

pub use activation::*;
pub use module::*;
pub use tensor::*;
