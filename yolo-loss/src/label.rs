//! Conversion between padded label batches and per-image label lists.

use crate::common::*;
use label::{labels_from_rows, Label, NormLabel};

/// A class-labeled box with geometry relative to the image size.
pub type RatioLabel = NormLabel<f64>;

/// Split a `[batch, max_boxes, 5]` padded label tensor into per-image lists.
///
/// Each image keeps the rows before its first all-zero padding row.
pub fn labels_from_tensor(labels: &Tensor) -> Result<Vec<Vec<RatioLabel>>> {
    let (batch_size, max_boxes, num_fields) = labels.size3()?;
    ensure!(
        num_fields == 5,
        "expect a [batch, boxes, 5] label tensor, but get shape {:?}",
        labels.size()
    );

    let values = Vec::<f64>::from(
        &labels
            .detach()
            .to_device(Device::Cpu)
            .to_kind(Kind::Double)
            .contiguous()
            .view([-1]),
    );

    let rows: Vec<[f64; 5]> = values
        .chunks_exact(5)
        .map(|row| [row[0], row[1], row[2], row[3], row[4]])
        .collect();

    if max_boxes == 0 {
        return Ok(vec![vec![]; batch_size as usize]);
    }

    rows.chunks_exact(max_boxes as usize)
        .enumerate()
        .map(|(index, rows)| {
            labels_from_rows(rows).with_context(|| format!("invalid label in image {}", index))
        })
        .collect()
}

/// Pad per-image labels with all-zero rows into a `[batch, max_boxes, 5]` tensor.
pub fn collate_labels(labels: &[Vec<RatioLabel>], device: Device) -> Result<Tensor> {
    let batch_size = labels.len();
    let max_boxes = labels.iter().map(|labels| labels.len()).max().unwrap_or(0);

    ensure!(
        labels.iter().flatten().all(|label| !label.is_padding()),
        "labels with all-zero geometry cannot be told apart from padding"
    );

    let values: Vec<f32> = labels
        .iter()
        .flat_map(|labels| {
            let padding = iter::repeat([0.0; 5]).take(max_boxes - labels.len());
            labels.iter().map(Label::to_row).chain(padding)
        })
        .flatten()
        .map(|value| value as f32)
        .collect();

    Ok(Tensor::of_slice(&values)
        .view([batch_size as i64, max_boxes as i64, 5])
        .to_device(device))
}
