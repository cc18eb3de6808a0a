//! Anchor target assignment and the multi-scale detection loss.

mod common;
pub mod anchors;
pub mod assign;
pub mod config;
pub mod counter;
pub mod label;
pub mod loss;
pub mod profiling;

pub use anchors::{AnchorSet, ScaleDescriptor};
pub use assign::{
    stack_targets, BoxAssignment, CellIndex, ImageTargets, TargetAssigner, TargetAssignerInit,
    TargetCell, TargetGrid,
};
pub use config::{Lambdas, LossConfig};
pub use counter::InstanceCounter;
pub use self::label::{collate_labels, labels_from_tensor, RatioLabel};
pub use loss::{
    decode_boxes, ScaleLoss, YoloLoss, YoloLossAuxiliary, YoloLossInit, YoloLossOutput,
};
