use crate::common::*;

/// Box size without position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HW<T> {
    h: T,
    w: T,
}

impl<T> HW<T>
where
    T: Num + PartialOrd + Copy,
{
    pub fn try_from_hw(hw: [T; 2]) -> Result<Self> {
        let [h, w] = hw;
        let zero = T::zero();
        ensure!(
            h >= zero && w >= zero,
            "height and width parameters must be non-negative"
        );
        Ok(Self { h, w })
    }

    pub fn from_hw(hw: [T; 2]) -> Self {
        Self::try_from_hw(hw).unwrap()
    }

    /// Build from x-first `[w, h]` parameters.
    pub fn try_from_wh(wh: [T; 2]) -> Result<Self> {
        let [w, h] = wh;
        Self::try_from_hw([h, w])
    }

    pub fn area(&self) -> T {
        self.w * self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn h(&self) -> T {
        self.h
    }
}

impl<T> HW<T>
where
    T: Float,
{
    /// Shape-only IoU with another size, as if both boxes shared a center.
    pub fn shape_iou_with(&self, other: &Self) -> T {
        let inter = self.w.min(other.w) * self.h.min(other.h);
        let union = self.area() + other.area() - inter;
        inter / union
    }
}

/// Rank-ready shape similarity of a box size against each anchor size.
///
/// Positions are ignored. Both sides must be in the same unit.
pub fn width_height_overlap<T>(bbox: &HW<T>, anchors: &[HW<T>]) -> Vec<T>
where
    T: Float,
{
    anchors
        .iter()
        .map(|anchor| bbox.shape_iou_with(anchor))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn size_area() {
        let s1 = HW::from_hw([3.0, 2.0]);
        let area: f64 = s1.area();
        assert_abs_diff_eq!(area, 6.0);
    }

    #[test]
    fn identical_anchor_overlap() {
        let bbox = HW::try_from_wh([0.2, 0.1]).unwrap();
        let anchors = [
            HW::try_from_wh([0.05, 0.05]).unwrap(),
            HW::try_from_wh([0.2, 0.1]).unwrap(),
            HW::try_from_wh([0.1, 0.4]).unwrap(),
        ];
        let scores = width_height_overlap(&bbox, &anchors);
        assert_eq!(scores.len(), 3);
        assert_abs_diff_eq!(scores[1], 1.0);
        assert!(scores[0] < 1.0 && scores[2] < 1.0);
    }

    #[test]
    fn nested_shapes() {
        // 0.1x0.1 inside 0.2x0.2: 0.01 / 0.04
        let bbox = HW::from_hw([0.1, 0.1]);
        let anchor = HW::from_hw([0.2, 0.2]);
        assert_abs_diff_eq!(bbox.shape_iou_with(&anchor), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(anchor.shape_iou_with(&bbox), 0.25, epsilon = 1e-12);
    }
}
