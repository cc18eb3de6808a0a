use crate::{common::*, hw::HW};

/// Box geometry given by its center and size.
///
/// Construction rejects negative sizes and non-finite parameters. Accessors
/// and the x-first `[x, y, w, h]` layout match the label row order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CyCxHW<T> {
    cy: T,
    cx: T,
    h: T,
    w: T,
}

impl<T> CyCxHW<T>
where
    T: Float,
{
    pub fn try_from_xywh(xywh: [T; 4]) -> Result<Self> {
        let [cx, cy, w, h] = xywh;
        ensure!(
            [cx, cy, w, h].iter().all(|value| value.is_finite()),
            "box parameters must be finite"
        );
        ensure!(
            w >= T::zero() && h >= T::zero(),
            "box height and width must be non-negative"
        );
        Ok(Self { cy, cx, h, w })
    }

    /// Build from the top-left corner and size, `[t, l, h, w]`.
    pub fn try_from_tlhw(tlhw: [T; 4]) -> Result<Self> {
        let [t, l, h, w] = tlhw;
        let two = T::one() + T::one();
        Self::try_from_xywh([l + w / two, t + h / two, w, h])
    }

    pub fn cy(&self) -> T {
        self.cy
    }

    pub fn cx(&self) -> T {
        self.cx
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn xywh(&self) -> [T; 4] {
        [self.cx, self.cy, self.w, self.h]
    }

    /// The box size with its position dropped.
    pub fn size(&self) -> HW<T> {
        HW::from_hw([self.h, self.w])
    }
}
