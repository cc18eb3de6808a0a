//! Greedy assignment of ground truth boxes to anchor grid cells.

use crate::{
    anchors::{AnchorSet, ScaleDescriptor},
    common::*,
    config::{ANCHORS_PER_SCALE, NUM_SCALES},
    counter::InstanceCounter,
    label::RatioLabel,
};
use bbox::{width_height_overlap, HW};
use std::cmp::Ordering as CmpOrdering;

/// Number of values per target grid cell: `[tx, ty, tw, th, objectness, class_id]`.
pub const TARGET_ENTRIES: usize = 6;

/// Position of a cell in the target grid of one scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellIndex {
    pub anchor: usize,
    pub row: usize,
    pub col: usize,
}

/// The target values of one (anchor, row, col) slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TargetCell {
    /// Center x offset within the cell.
    pub tx: f64,
    /// Center y offset within the cell.
    pub ty: f64,
    /// Width in cell units.
    pub tw: f64,
    /// Height in cell units.
    pub th: f64,
    pub positive: bool,
    pub class_id: usize,
}

/// The dense targets of one image at one scale.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGrid {
    scale: ScaleDescriptor,
    cells: Vec<TargetCell>,
}

impl TargetGrid {
    pub fn new(scale: ScaleDescriptor) -> Self {
        Self {
            scale,
            cells: vec![TargetCell::default(); scale.num_cells()],
        }
    }

    pub fn scale(&self) -> &ScaleDescriptor {
        &self.scale
    }

    fn flat_index(&self, index: &CellIndex) -> usize {
        let ScaleDescriptor { grid_h, grid_w, .. } = self.scale;
        debug_assert!(index.anchor < ANCHORS_PER_SCALE && index.row < grid_h && index.col < grid_w);
        (index.anchor * grid_h + index.row) * grid_w + index.col
    }

    pub fn cell(&self, index: &CellIndex) -> &TargetCell {
        &self.cells[self.flat_index(index)]
    }

    pub fn is_occupied(&self, index: &CellIndex) -> bool {
        self.cell(index).positive
    }

    fn claim(&mut self, index: &CellIndex, cell: TargetCell) {
        let flat_index = self.flat_index(index);
        self.cells[flat_index] = cell;
    }

    pub fn num_positives(&self) -> usize {
        self.cells.iter().filter(|cell| cell.positive).count()
    }

    /// Iterate over the claimed cells in (anchor, row, col) order.
    pub fn positives(&self) -> impl Iterator<Item = (CellIndex, &TargetCell)> + '_ {
        let ScaleDescriptor { grid_h, grid_w, .. } = self.scale;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.positive)
            .map(move |(flat_index, cell)| {
                let index = CellIndex {
                    anchor: flat_index / (grid_h * grid_w),
                    row: flat_index / grid_w % grid_h,
                    col: flat_index % grid_w,
                };
                (index, cell)
            })
    }

    /// Recover the normalized `[x, y, w, h]` box of a claimed cell.
    pub fn to_normalized_box(&self, index: &CellIndex) -> Option<[f64; 4]> {
        let cell = self.cell(index);
        let grid_h = self.scale.grid_h as f64;
        let grid_w = self.scale.grid_w as f64;

        cell.positive.then(|| {
            [
                (index.col as f64 + cell.tx) / grid_w,
                (index.row as f64 + cell.ty) / grid_h,
                cell.tw / grid_w,
                cell.th / grid_h,
            ]
        })
    }

    /// Pack into a `[3, height, width, 6]` float tensor.
    pub fn to_tensor(&self, device: Device) -> Tensor {
        let ScaleDescriptor { grid_h, grid_w, .. } = self.scale;
        let values: Vec<f32> = self
            .cells
            .iter()
            .flat_map(|cell| {
                let objectness = if cell.positive { 1.0 } else { 0.0 };
                [
                    cell.tx,
                    cell.ty,
                    cell.tw,
                    cell.th,
                    objectness,
                    cell.class_id as f64,
                ]
            })
            .map(|value| value as f32)
            .collect();

        Tensor::of_slice(&values)
            .view([
                ANCHORS_PER_SCALE as i64,
                grid_h as i64,
                grid_w as i64,
                TARGET_ENTRIES as i64,
            ])
            .to_device(device)
    }
}

/// The slots claimed by one ground truth box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxAssignment {
    pub instance_id: usize,
    pub class_id: usize,
    /// The claimed cell per scale, `None` if every candidate cell was taken.
    pub claimed: [Option<CellIndex>; NUM_SCALES],
}

impl BoxAssignment {
    pub fn num_claimed(&self) -> usize {
        self.claimed.iter().flatten().count()
    }
}

/// The targets of one image at every scale.
#[derive(Debug, Clone, PartialEq, Getters)]
pub struct ImageTargets {
    #[get = "pub"]
    grids: Vec<TargetGrid>,
    #[get = "pub"]
    assignments: Vec<BoxAssignment>,
}

impl ImageTargets {
    pub fn num_positives(&self) -> usize {
        self.grids.iter().map(TargetGrid::num_positives).sum()
    }
}

/// Stack one scale of per-image targets into a `[batch, 3, height, width, 6]` tensor.
pub fn stack_targets(targets: &[ImageTargets], scale: usize, device: Device) -> Result<Tensor> {
    ensure!(!targets.is_empty(), "cannot stack targets of an empty batch");
    ensure!(scale < NUM_SCALES, "scale index {} is out of range", scale);

    let first = targets[0].grids[scale].scale();
    ensure!(
        targets
            .iter()
            .all(|image| image.grids[scale].scale() == first),
        "images have different grid sizes at scale {}",
        scale
    );

    let grids: Vec<_> = targets
        .iter()
        .map(|image| image.grids[scale].to_tensor(device))
        .collect();
    Ok(Tensor::stack(&grids, 0))
}

/// Target assigner initializer.
#[derive(Debug, Clone)]
pub struct TargetAssignerInit {
    pub anchors: AnchorSet,
    pub scales: Vec<ScaleDescriptor>,
    pub image_size: usize,
    pub num_classes: usize,
}

impl TargetAssignerInit {
    pub fn build(self) -> Result<TargetAssigner> {
        let Self {
            anchors,
            scales,
            image_size,
            num_classes,
        } = self;

        ensure!(image_size > 0, "image_size must be positive");
        ensure!(num_classes > 0, "num_classes must be positive");
        ensure!(
            scales.len() == NUM_SCALES,
            "expect {} scales, but get {}",
            NUM_SCALES,
            scales.len()
        );

        scales.iter().for_each(|scale| {
            let expect = image_size as f64 / scale.stride as f64;
            if scale.grid_h as f64 != expect || scale.grid_w as f64 != expect {
                warn!(
                    "the {}x{} grid of stride {} does not match the image size {}",
                    scale.grid_h, scale.grid_w, scale.stride, image_size
                );
            }
        });

        Ok(TargetAssigner {
            anchors: anchors.normalized(image_size),
            scales,
            num_classes,
        })
    }
}

/// Maps ground truth boxes onto the anchor grids of every scale.
#[derive(Debug, Clone)]
pub struct TargetAssigner {
    /// Anchor sizes relative to the image size.
    anchors: Vec<HW<f64>>,
    scales: Vec<ScaleDescriptor>,
    num_classes: usize,
}

impl TargetAssigner {
    pub fn scales(&self) -> &[ScaleDescriptor] {
        &self.scales
    }

    /// Assign the boxes of one image.
    ///
    /// Boxes starting from the first padding box are ignored.
    pub fn assign(
        &self,
        labels: &[RatioLabel],
        counter: &InstanceCounter,
    ) -> Result<ImageTargets> {
        let labels = truncate_padding(labels);
        let ids = counter.reserve(labels.len());
        self.assign_image(labels, ids)
    }

    /// Assign every image of a batch.
    ///
    /// Images run in parallel. Instance ids follow image order, so the
    /// result equals assigning the images one by one.
    pub fn assign_batch(
        &self,
        batch: &[Vec<RatioLabel>],
        counter: &InstanceCounter,
    ) -> Result<Vec<ImageTargets>> {
        let jobs: Vec<(&[RatioLabel], Range<usize>)> = batch
            .iter()
            .map(|labels| {
                let labels = truncate_padding(labels);
                (labels, counter.reserve(labels.len()))
            })
            .collect();

        jobs.into_par_iter()
            .enumerate()
            .map(|(index, (labels, ids))| {
                self.assign_image(labels, ids)
                    .with_context(|| format!("unable to assign targets for image {}", index))
            })
            .collect()
    }

    fn assign_image(&self, labels: &[RatioLabel], ids: Range<usize>) -> Result<ImageTargets> {
        debug_assert_eq!(labels.len(), ids.len());

        let mut grids: Vec<TargetGrid> = self.scales.iter().cloned().map(TargetGrid::new).collect();

        // earlier boxes win contested cells
        let assignments: Vec<BoxAssignment> = izip!(labels, ids)
            .map(|(label, instance_id)| self.assign_box(&mut grids, label, instance_id))
            .collect::<Result<_>>()?;

        Ok(ImageTargets { grids, assignments })
    }

    fn assign_box(
        &self,
        grids: &mut [TargetGrid],
        label: &RatioLabel,
        instance_id: usize,
    ) -> Result<BoxAssignment> {
        let class_id = label.class;
        ensure!(
            class_id < self.num_classes,
            "class id {} is out of range for {} classes",
            class_id,
            self.num_classes
        );

        let (x, y) = (label.rect.cx(), label.rect.cy());
        let size = label.rect.size();
        let (w, h) = (size.w(), size.h());
        if size.area() == 0.0 {
            warn!("box {} has zero width or height", instance_id);
        }

        // resolve the cell at every scale first, so a bad center always fails
        let cells: Vec<(usize, usize)> = grids
            .iter()
            .map(|grid| grid.scale().cell_of(x, y))
            .collect::<Result<_>>()?;

        let overlaps = width_height_overlap(&size, &self.anchors);
        let mut ranking: Vec<usize> = (0..overlaps.len()).collect();
        // stable sort keeps the lower anchor index first on ties
        ranking.sort_by(|&lhs, &rhs| {
            overlaps[rhs]
                .partial_cmp(&overlaps[lhs])
                .unwrap_or(CmpOrdering::Equal)
        });

        let mut claimed = [None; NUM_SCALES];

        for anchor_index in ranking {
            let scale_index = anchor_index / ANCHORS_PER_SCALE;
            if claimed[scale_index].is_some() {
                continue;
            }

            let grid = &mut grids[scale_index];
            let (row, col) = cells[scale_index];
            let index = CellIndex {
                anchor: anchor_index % ANCHORS_PER_SCALE,
                row,
                col,
            };
            if grid.is_occupied(&index) {
                continue;
            }

            let grid_h = grid.scale().grid_h as f64;
            let grid_w = grid.scale().grid_w as f64;
            grid.claim(
                &index,
                TargetCell {
                    tx: grid_w * x - col as f64,
                    ty: grid_h * y - row as f64,
                    tw: grid_w * w,
                    th: grid_h * h,
                    positive: true,
                    class_id,
                },
            );
            claimed[scale_index] = Some(index);
        }

        claimed
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.is_none())
            .for_each(|(scale_index, _)| {
                debug!(
                    "box {} receives no cell at scale {} due to collisions",
                    instance_id, scale_index
                );
            });

        Ok(BoxAssignment {
            instance_id,
            class_id,
            claimed,
        })
    }
}

fn truncate_padding(labels: &[RatioLabel]) -> &[RatioLabel] {
    let len = labels
        .iter()
        .position(|label| label.is_padding())
        .unwrap_or(labels.len());
    &labels[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn assigner() -> TargetAssigner {
        let pixels: Vec<_> = [
            [10.0, 13.0],
            [16.0, 30.0],
            [33.0, 23.0],
            [30.0, 61.0],
            [62.0, 45.0],
            [59.0, 119.0],
            [116.0, 90.0],
            [156.0, 198.0],
            [373.0, 326.0],
        ]
        .to_vec();
        let scales = [8, 16, 32]
            .iter()
            .map(|&stride| ScaleDescriptor {
                stride,
                grid_h: 64 / stride,
                grid_w: 64 / stride,
            })
            .collect();

        TargetAssignerInit {
            anchors: AnchorSet::new(&pixels).unwrap(),
            scales,
            image_size: 64,
            num_classes: 4,
        }
        .build()
        .unwrap()
    }

    fn label(class: f64, x: f64, y: f64, w: f64, h: f64) -> RatioLabel {
        RatioLabel::try_from_row([class, x, y, w, h]).unwrap()
    }

    #[test]
    fn single_box_claims_one_cell_per_scale() -> Result<()> {
        let assigner = assigner();
        let counter = InstanceCounter::new();
        let targets = assigner.assign(&[label(2.0, 0.3, 0.6, 0.2, 0.4)], &counter)?;

        assert_eq!(targets.num_positives(), 3);
        targets
            .grids()
            .iter()
            .for_each(|grid| assert_eq!(grid.num_positives(), 1));

        let assignment = &targets.assignments()[0];
        assert_eq!(assignment.num_claimed(), 3);
        assert_eq!(assignment.class_id, 2);
        assert_eq!(assignment.instance_id, 0);

        // the finest 8x8 grid
        let index = assignment.claimed[0].unwrap();
        assert_eq!((index.row, index.col), (4, 2));
        let cell = targets.grids()[0].cell(&index);
        assert_abs_diff_eq!(cell.tx, 8.0 * 0.3 - 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cell.ty, 8.0 * 0.6 - 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cell.tw, 8.0 * 0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(cell.th, 8.0 * 0.4, epsilon = 1e-9);
        assert_eq!(cell.class_id, 2);
        Ok(())
    }

    #[test]
    fn earlier_box_wins_collision() -> Result<()> {
        let assigner = assigner();
        let counter = InstanceCounter::new();
        let first = label(0.0, 0.5, 0.5, 0.2, 0.2);
        let second = label(1.0, 0.51, 0.52, 0.2, 0.2);

        let alone = assigner.assign(&[first], &counter)?;
        let both = assigner.assign(&[first, second], &counter)?;

        // the first box is unaffected by the second one
        izip!(&alone.assignments()[0].claimed, &both.assignments()[0].claimed).for_each(
            |(lhs, rhs)| {
                assert_eq!(lhs, rhs);
            },
        );
        izip!(alone.grids(), both.grids()).for_each(|(alone, both)| {
            alone.positives().for_each(|(index, cell)| {
                assert_eq!(both.cell(&index), cell);
            });
        });

        // identical shapes rank anchors identically, so the second box takes
        // the next best anchor of the same cell
        let second = &both.assignments()[1];
        izip!(&both.assignments()[0].claimed, &second.claimed).for_each(|(first, second)| {
            if let (Some(first), Some(second)) = (first, second) {
                assert_ne!(first, second);
            }
        });
        assert_eq!(both.num_positives(), 6);
        Ok(())
    }

    #[test]
    fn padding_truncates_the_rest() -> Result<()> {
        let assigner = assigner();
        let counter = InstanceCounter::new();
        let padding = label(0.0, 0.0, 0.0, 0.0, 0.0);
        let targets = assigner.assign(&[padding, label(1.0, 0.5, 0.5, 0.1, 0.1)], &counter)?;
        assert_eq!(targets.num_positives(), 0);
        assert!(targets.assignments().is_empty());
        assert_eq!(counter.peek(), 0);
        Ok(())
    }

    #[test]
    fn reject_out_of_range_input() {
        let assigner = assigner();
        let counter = InstanceCounter::new();
        assert!(assigner
            .assign(&[label(4.0, 0.5, 0.5, 0.1, 0.1)], &counter)
            .is_err());
        assert!(assigner
            .assign(&[label(0.0, 1.0, 0.5, 0.1, 0.1)], &counter)
            .is_err());
    }

    #[test]
    fn grid_tensor_layout() -> Result<()> {
        let assigner = assigner();
        let counter = InstanceCounter::new();
        let targets = assigner.assign(&[label(3.0, 0.3, 0.6, 0.2, 0.4)], &counter)?;
        let index = targets.assignments()[0].claimed[1].unwrap();

        let tensor = targets.grids()[1].to_tensor(Device::Cpu);
        assert_eq!(tensor.size(), vec![3, 4, 4, 6]);
        let cell = tensor.i((index.anchor as i64, index.row as i64, index.col as i64));
        assert_abs_diff_eq!(cell.double_value(&[4]), 1.0);
        assert_abs_diff_eq!(cell.double_value(&[5]), 3.0);
        assert_abs_diff_eq!(tensor.select(-1, 4).sum(Kind::Float).double_value(&[]), 1.0);
        Ok(())
    }
}
