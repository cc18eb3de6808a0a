//! Overlap metrics between two batches of boxes.

use crate::{box_tensor::TLBRTensor, common::*, tensor::TensorExt};

/// The default term added to overlap denominators.
pub const EPSILON: f64 = 1e-7;

/// How the four geometric numbers of a box are laid out.
///
/// The column order is x-first in all cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoxFormat {
    /// `[x_center, y_center, width, height]`
    CxCyWH,
    /// `[left, top, width, height]`
    LTWH,
    /// `[left, top, right, bottom]`
    LTRB,
}

impl BoxFormat {
    /// Interpret a `[batch, 4]` tensor as boxes in this format.
    pub fn to_tlbr_tensor(&self, boxes: &Tensor) -> Result<TLBRTensor> {
        match self {
            Self::CxCyWH => TLBRTensor::from_xywh(boxes),
            Self::LTWH => TLBRTensor::from_ltwh(boxes),
            Self::LTRB => TLBRTensor::from_ltrb(boxes),
        }
    }
}

/// The overlap metric variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoUKind {
    IoU,
    GIoU,
    DIoU,
    CIoU,
}

impl IoUKind {
    pub fn compute(&self, lhs: &TLBRTensor, rhs: &TLBRTensor, epsilon: f64) -> Tensor {
        match self {
            Self::IoU => lhs.iou_with(rhs, epsilon),
            Self::GIoU => lhs.giou_with(rhs, epsilon),
            Self::DIoU => lhs.diou_with(rhs, epsilon),
            Self::CIoU => lhs.ciou_with(rhs, epsilon),
        }
    }
}

/// Box overlap initializer.
#[derive(Debug, Clone)]
pub struct BoxOverlapInit {
    pub format: BoxFormat,
    pub kind: IoUKind,
    pub epsilon: f64,
    pub device: Device,
}

impl BoxOverlapInit {
    pub fn default(kind: IoUKind, device: Device) -> Self {
        Self {
            format: BoxFormat::CxCyWH,
            kind,
            epsilon: EPSILON,
            device,
        }
    }

    pub fn build(self) -> Result<BoxOverlap> {
        let Self {
            format,
            kind,
            epsilon,
            device,
        } = self;

        ensure!(
            epsilon.is_finite() && epsilon >= 0.0,
            "epsilon must be a non-negative finite number"
        );
        if epsilon == 0.0 {
            warn!("zero epsilon yields NaN scores on degenerate boxes");
        }

        Ok(BoxOverlap {
            format,
            kind,
            epsilon,
            device,
        })
    }
}

/// Pairwise overlap of two equally sized box batches.
#[derive(Debug, Clone)]
pub struct BoxOverlap {
    format: BoxFormat,
    kind: IoUKind,
    epsilon: f64,
    device: Device,
}

impl BoxOverlap {
    pub fn kind(&self) -> IoUKind {
        self.kind
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Compute the overlap of row `i` of `lhs` with row `i` of `rhs`.
    ///
    /// Both inputs are `[batch, 4]` tensors on the configured device. The
    /// output has shape `[batch]`.
    pub fn forward(&self, lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
        lhs.ensure_device(self.device)?;
        rhs.ensure_device(self.device)?;
        ensure!(
            lhs.size() == rhs.size(),
            "box batches must have equal shape, but get {:?} and {:?}",
            lhs.size(),
            rhs.size()
        );

        let lhs = self.format.to_tlbr_tensor(lhs)?;
        let rhs = self.format.to_tlbr_tensor(rhs)?;
        let score = self.kind.compute(&lhs, &rhs, self.epsilon);

        Ok(score.view([-1]))
    }
}
