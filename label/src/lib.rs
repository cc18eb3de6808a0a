//! Class-labeled bounding boxes and the padded row codec used by batches.

use anyhow::{ensure, format_err, Result};
use bbox::CyCxHW;
use num_traits::Float;

/// A box paired with a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label<R, C> {
    pub rect: R,
    pub class: C,
}

/// A class-labeled box with normalized x-first center-size geometry.
pub type NormLabel<T> = Label<CyCxHW<T>, usize>;

impl<T> Label<CyCxHW<T>, usize>
where
    T: Float,
{
    /// Decode a `[class, x, y, w, h]` row.
    pub fn try_from_row(row: [T; 5]) -> Result<Self> {
        let [class, x, y, w, h] = row;
        ensure!(
            class >= T::zero() && class.fract() == T::zero(),
            "class id must be a non-negative integer"
        );
        let class = class
            .to_usize()
            .ok_or_else(|| format_err!("class id is out of range"))?;
        let rect = CyCxHW::try_from_xywh([x, y, w, h])?;
        Ok(Self { rect, class })
    }

    /// Encode into a `[class, x, y, w, h]` row.
    pub fn to_row(&self) -> [T; 5] {
        let [x, y, w, h] = self.rect.xywh();
        // usize always fits a float, possibly with rounding
        let class = T::from(self.class).unwrap_or_else(T::max_value);
        [class, x, y, w, h]
    }

    /// Normalize a pixel annotation given as top-left corner and size.
    ///
    /// Boxes that extend past the image border are rejected.
    pub fn from_pixel_tlwh(class: usize, tlwh: [T; 4], image_w: T, image_h: T) -> Result<Self> {
        let [left, top, width, height] = tlwh;
        let zero = T::zero();
        let one = T::one();
        ensure!(
            image_w > zero && image_h > zero,
            "image size must be positive"
        );

        let l = left / image_w;
        let t = top / image_h;
        let w = width / image_w;
        let h = height / image_h;
        ensure!(
            l >= zero && t >= zero && l + w <= one && t + h <= one,
            "the box exceeds the image boundary"
        );

        let rect = CyCxHW::try_from_tlhw([t, l, h, w])?;
        Ok(Self { rect, class })
    }

    /// Returns true if all geometric fields are exactly zero.
    pub fn is_padding(&self) -> bool {
        is_padding_row(&self.to_row())
    }
}

/// Returns true if the `[class, x, y, w, h]` row is a padding sentinel.
///
/// The class field is ignored.
pub fn is_padding_row<T>(row: &[T; 5]) -> bool
where
    T: Float,
{
    row[1..].iter().all(|value| *value == T::zero())
}

/// Drop the first padding row and everything after it.
pub fn truncate_padding<T>(rows: &[[T; 5]]) -> &[[T; 5]]
where
    T: Float,
{
    let len = rows
        .iter()
        .position(|row| is_padding_row(row))
        .unwrap_or(rows.len());
    &rows[..len]
}

/// Decode label rows up to the first padding row.
pub fn labels_from_rows<T>(rows: &[[T; 5]]) -> Result<Vec<NormLabel<T>>>
where
    T: Float,
{
    truncate_padding(rows)
        .iter()
        .map(|row| Label::try_from_row(*row))
        .collect()
}
