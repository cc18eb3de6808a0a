//! Loss function building blocks.

mod bce_with_logit_loss;
mod decode;
mod loss;

pub use bce_with_logit_loss::*;
pub use decode::*;
pub use loss::*;
