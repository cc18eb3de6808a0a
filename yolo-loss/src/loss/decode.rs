use crate::common::*;

/// Decode raw box logits into cell-relative center-size boxes.
///
/// `raw` is a `[batch, entries]` tensor whose first four columns are the
/// `x, y, w, h` logits, and `anchors` holds the matching `[batch, 2]` anchor
/// sizes in grid units. The `[batch, 4]` output is laid out as `[x, y, w, h]`.
/// Centers fall in `[-0.5, 1.5]` relative to the cell corner and sizes in
/// `[0, 4]` times the anchor.
pub fn decode_boxes(raw: &Tensor, anchors: &Tensor) -> Result<Tensor> {
    let (num_boxes, num_entries) = raw.size2()?;
    ensure!(
        num_entries >= 4,
        "expect at least 4 entries per box, but get {}",
        num_entries
    );
    ensure!(
        anchors.size2()? == (num_boxes, 2),
        "expect a [{}, 2] anchor tensor, but get shape {:?}",
        num_boxes,
        anchors.size()
    );
    anchors.ensure_device(raw.device())?;

    let xy = raw.narrow(1, 0, 2).sigmoid() * 2.0 - 0.5;
    let wh_ratio = raw.narrow(1, 2, 2).sigmoid() * 2.0;
    let wh = &wh_ratio * &wh_ratio * anchors;

    Ok(Tensor::cat(&[xy, wh], 1))
}
