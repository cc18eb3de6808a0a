//! Batched boxes stored as corner columns.

use crate::common::*;
use std::f64::consts::PI;

/// Batched boxes in TLBR form, one `[batch, 1]` column per edge.
#[derive(Debug, TensorLike, Getters)]
pub struct TLBRTensor {
    #[get = "pub"]
    t: Tensor,
    #[get = "pub"]
    l: Tensor,
    #[get = "pub"]
    b: Tensor,
    #[get = "pub"]
    r: Tensor,
}

impl TLBRTensor {
    /// Parse `[x_center, y_center, width, height]` rows.
    pub fn from_xywh(boxes: &Tensor) -> Result<Self> {
        let [cx, cy, w, h] = split_columns(boxes)?;
        let half_w = w / 2.0;
        let half_h = h / 2.0;
        Ok(Self {
            t: &cy - &half_h,
            l: &cx - &half_w,
            b: cy + half_h,
            r: cx + half_w,
        })
    }

    /// Parse `[left, top, width, height]` rows.
    pub fn from_ltwh(boxes: &Tensor) -> Result<Self> {
        let [l, t, w, h] = split_columns(boxes)?;
        Ok(Self {
            b: &t + h,
            r: &l + w,
            t,
            l,
        })
    }

    /// Parse `[left, top, right, bottom]` rows.
    pub fn from_ltrb(boxes: &Tensor) -> Result<Self> {
        let [l, t, r, b] = split_columns(boxes)?;
        Ok(Self { t, l, b, r })
    }

    pub fn device(&self) -> Device {
        self.t.device()
    }

    /// Height and width columns.
    fn hw(&self) -> (Tensor, Tensor) {
        (&self.b - &self.t, &self.r - &self.l)
    }

    pub fn area(&self) -> Tensor {
        let (h, w) = self.hw();
        h * w
    }

    /// Intersection area, zero where the boxes do not meet.
    pub fn intersect_area_with(&self, other: &Self) -> Tensor {
        let inner_h = (self.b.minimum(&other.b) - self.t.maximum(&other.t)).clamp_min(0.0);
        let inner_w = (self.r.minimum(&other.r) - self.l.maximum(&other.l)).clamp_min(0.0);
        inner_h * inner_w
    }

    /// The smallest boxes enclosing both inputs.
    pub fn closure_with(&self, other: &Self) -> Self {
        Self {
            t: self.t.minimum(&other.t),
            l: self.l.minimum(&other.l),
            b: self.b.maximum(&other.b),
            r: self.r.maximum(&other.r),
        }
    }

    /// Returns `(intersection, union)`, the union already offset by `epsilon`.
    fn inter_union_with(&self, other: &Self, epsilon: f64) -> (Tensor, Tensor) {
        let inter = self.intersect_area_with(other);
        let union = self.area() + other.area() - &inter + epsilon;
        (inter, union)
    }

    /// Squared center distance over the squared closure diagonal.
    fn center_distance_ratio(&self, other: &Self, epsilon: f64) -> Tensor {
        let (closure_h, closure_w) = self.closure_with(other).hw();
        let diagonal_square = &closure_h * &closure_h + &closure_w * &closure_w + epsilon;

        // doubled centers, hence the division by 4
        let dy = (&other.t + &other.b) - (&self.t + &self.b);
        let dx = (&other.l + &other.r) - (&self.l + &self.r);
        let center_dist_square = (&dy * &dy + &dx * &dx) / 4.0;

        center_dist_square / diagonal_square
    }

    pub fn iou_with(&self, other: &Self, epsilon: f64) -> Tensor {
        let (inter, union) = self.inter_union_with(other, epsilon);
        inter / union
    }

    pub fn giou_with(&self, other: &Self, epsilon: f64) -> Tensor {
        let (inter, union) = self.inter_union_with(other, epsilon);
        let iou = &inter / &union;
        let closure_area = self.closure_with(other).area() + epsilon;
        iou - (&closure_area - &union) / &closure_area
    }

    pub fn diou_with(&self, other: &Self, epsilon: f64) -> Tensor {
        self.iou_with(other, epsilon) - self.center_distance_ratio(other, epsilon)
    }

    /// CIoU score. The aspect ratio trade-off coefficient carries no gradient.
    pub fn ciou_with(&self, other: &Self, epsilon: f64) -> Tensor {
        let iou = self.iou_with(other, epsilon);

        let (self_h, self_w) = self.hw();
        let (other_h, other_w) = other.hw();
        let angle_diff = (other_w / other_h).atan() - (self_w / self_h).atan();
        let shape_loss = &angle_diff * &angle_diff * (4.0 / PI.powi(2));
        let shape_loss_coef =
            tch::no_grad(|| &shape_loss / (&shape_loss - &iou + (1.0 + epsilon)));

        iou - (self.center_distance_ratio(other, epsilon) + shape_loss * shape_loss_coef)
    }
}

fn split_columns(boxes: &Tensor) -> Result<[Tensor; 4]> {
    let (_, num_params) = boxes.size2()?;
    ensure!(
        num_params == 4,
        "expect a [batch, 4] tensor, but get shape {:?}",
        boxes.size()
    );
    Ok([0, 1, 2, 3].map(|index| boxes.narrow(1, index, 1)))
}
