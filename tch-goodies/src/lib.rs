//! Batched box tensors and differentiable overlap metrics.

mod common;
pub mod box_tensor;
pub mod overlap;
pub mod tensor;

pub use box_tensor::*;
pub use overlap::*;
pub use tensor::*;
