use anyhow::Result;
use approx::assert_abs_diff_eq;
use bbox::{width_height_overlap, HW};
use rand::prelude::*;
use tch::{Device, Kind, Tensor};
use yolo_loss::{
    decode_boxes, stack_targets, AnchorSet, InstanceCounter, LossConfig, RatioLabel,
    ScaleDescriptor, TargetAssigner, TargetAssignerInit,
};

const IMAGE_SIZE: usize = 64;
const STRIDES: [usize; 3] = [8, 16, 32];

fn assigner() -> Result<TargetAssigner> {
    let config = LossConfig {
        image_size: IMAGE_SIZE,
        ..LossConfig::new(4)
    };
    let scales = STRIDES
        .iter()
        .map(|&stride| ScaleDescriptor {
            stride,
            grid_h: IMAGE_SIZE / stride,
            grid_w: IMAGE_SIZE / stride,
        })
        .collect();

    TargetAssignerInit {
        anchors: config.anchor_set()?,
        scales,
        image_size: IMAGE_SIZE,
        num_classes: 4,
    }
    .build()
}

fn label(class: usize, x: f64, y: f64, w: f64, h: f64) -> RatioLabel {
    RatioLabel::try_from_row([class as f64, x, y, w, h]).unwrap()
}

fn logit(prob: f64) -> f64 {
    (prob / (1.0 - prob)).ln()
}

#[test]
fn anchor_of_equal_shape_overlaps_fully() -> Result<()> {
    let anchors = AnchorSet::new(&[
        [10.0, 13.0],
        [16.0, 30.0],
        [33.0, 23.0],
        [30.0, 61.0],
        [62.0, 45.0],
        [59.0, 119.0],
        [116.0, 90.0],
        [156.0, 198.0],
        [373.0, 326.0],
    ])?;
    let normalized = anchors.normalized(640);
    let bbox = HW::try_from_wh([62.0 / 640.0, 45.0 / 640.0])?;
    let overlaps = width_height_overlap(&bbox, &normalized);

    assert_abs_diff_eq!(overlaps[4], 1.0, epsilon = 1e-12);
    overlaps
        .iter()
        .enumerate()
        .filter(|&(index, _)| index != 4)
        .for_each(|(_, &overlap)| assert!(overlap < 1.0));
    Ok(())
}

#[test]
fn width_height_overlap_ignores_position() -> Result<()> {
    let assigner = assigner()?;
    let counter = InstanceCounter::new();

    let lhs = assigner.assign(&[label(0, 0.2, 0.3, 0.2, 0.4)], &counter)?;
    let rhs = assigner.assign(&[label(0, 0.7, 0.9, 0.2, 0.4)], &counter)?;

    // same shape, hence the same anchor choice per scale
    let anchors = |targets: &yolo_loss::ImageTargets| -> Vec<usize> {
        targets.assignments()[0]
            .claimed
            .iter()
            .map(|cell| cell.unwrap().anchor)
            .collect()
    };
    assert_eq!(anchors(&lhs), anchors(&rhs));
    Ok(())
}

#[test]
fn padding_only_image_has_no_targets() -> Result<()> {
    let assigner = assigner()?;
    let counter = InstanceCounter::new();
    let targets = assigner.assign(&[label(0, 0.0, 0.0, 0.0, 0.0)], &counter)?;

    assert!(targets.assignments().is_empty());
    targets.grids().iter().for_each(|grid| {
        let tensor = grid.to_tensor(Device::Cpu);
        assert_abs_diff_eq!(tensor.select(-1, 4).abs().sum(Kind::Float).double_value(&[]), 0.0);
    });
    Ok(())
}

#[test]
fn later_boxes_run_out_of_cells() -> Result<()> {
    let assigner = assigner()?;
    let counter = InstanceCounter::new();
    let bbox = label(1, 0.5, 0.5, 0.2, 0.3);
    let late = label(3, 0.52, 0.51, 0.2, 0.3);

    // three equal boxes use up every anchor of the shared cell at every scale
    let targets = assigner.assign(&[bbox, bbox, bbox, late], &counter)?;
    let assignments = targets.assignments();

    assignments[..3]
        .iter()
        .for_each(|assignment| assert_eq!(assignment.num_claimed(), 3));
    assert_eq!(assignments[3].num_claimed(), 0);
    assert_eq!(targets.num_positives(), 9);

    // no cell carries the late box's class
    targets.grids().iter().for_each(|grid| {
        grid.positives()
            .for_each(|(_, cell)| assert_eq!(cell.class_id, 1));
    });
    Ok(())
}

#[test]
fn claimed_cell_keeps_class() -> Result<()> {
    let assigner = assigner()?;
    let counter = InstanceCounter::new();
    let targets = assigner.assign(&[label(2, 0.4, 0.55, 0.15, 0.25)], &counter)?;
    let stacked = stack_targets(&[targets], 0, Device::Cpu)?;
    assert_eq!(stacked.size(), vec![1, 3, 8, 8, 6]);

    let rows = stacked.view([-1, 6]);
    let positive = rows.select(1, 4).gt(0.5).nonzero().view([-1]);
    assert_eq!(positive.size(), vec![1]);

    let class_ids = rows.index_select(0, &positive).select(1, 5).to_kind(Kind::Int64);
    let one_hot = class_ids.one_hot(4).to_kind(Kind::Float);
    assert_eq!(Vec::<f32>::from(&one_hot.view([-1])), vec![0.0, 0.0, 1.0, 0.0]);
    Ok(())
}

#[test]
fn decoded_target_recovers_box() -> Result<()> {
    let assigner = assigner()?;
    let config = LossConfig {
        image_size: IMAGE_SIZE,
        ..LossConfig::new(4)
    };
    let anchors = config.anchor_set()?;
    let counter = InstanceCounter::new();

    let source = [0.3, 0.6, 0.2, 0.4];
    let [x, y, w, h] = source;
    let targets = assigner.assign(&[label(1, x, y, w, h)], &counter)?;
    let assignment = &targets.assignments()[0];

    for (scale_index, claimed) in assignment.claimed.iter().enumerate() {
        let index = claimed.unwrap();
        let grid = &targets.grids()[scale_index];
        let cell = grid.cell(&index);
        let ScaleDescriptor {
            stride,
            grid_h,
            grid_w,
        } = *grid.scale();

        // invert the decoding to get the logits of a perfect prediction
        let [anchor_w, anchor_h] = anchors.scale_anchors(scale_index, stride)[index.anchor];
        let raw = [
            logit((cell.tx + 0.5) / 2.0),
            logit((cell.ty + 0.5) / 2.0),
            logit((cell.tw / anchor_w).sqrt() / 2.0),
            logit((cell.th / anchor_h).sqrt() / 2.0),
        ];
        let raw = Tensor::of_slice(&raw).view([1, 4]);
        let anchor = Tensor::of_slice(&[anchor_w, anchor_h]).view([1, 2]);
        let decoded = Vec::<f64>::from(&decode_boxes(&raw, &anchor)?.view([-1]));

        let recovered = [
            (index.col as f64 + decoded[0]) / grid_w as f64,
            (index.row as f64 + decoded[1]) / grid_h as f64,
            decoded[2] / grid_w as f64,
            decoded[3] / grid_h as f64,
        ];
        recovered
            .iter()
            .zip(source.iter())
            .for_each(|(&lhs, &rhs)| assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-9));

        let stored = grid.to_normalized_box(&index).unwrap();
        stored
            .iter()
            .zip(source.iter())
            .for_each(|(&lhs, &rhs)| assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12));
    }
    Ok(())
}

#[test]
fn parallel_batch_matches_sequential() -> Result<()> {
    let _ = pretty_env_logger::try_init();
    let assigner = assigner()?;
    let mut rng = rand::thread_rng();

    let batch: Vec<Vec<RatioLabel>> = (0..16)
        .map(|_| {
            let num_boxes = rng.gen_range(0..12);
            (0..num_boxes)
                .map(|_| {
                    let w = rng.gen_range(0.02..0.6);
                    let h = rng.gen_range(0.02..0.6);
                    label(
                        rng.gen_range(0..4),
                        rng.gen_range(0.0..0.999),
                        rng.gen_range(0.0..0.999),
                        w,
                        h,
                    )
                })
                .collect()
        })
        .collect();

    let parallel = assigner.assign_batch(&batch, &InstanceCounter::starting_at(100))?;

    let counter = InstanceCounter::starting_at(100);
    let sequential: Vec<_> = batch
        .iter()
        .map(|labels| assigner.assign(labels, &counter))
        .collect::<Result<_>>()?;

    assert_eq!(parallel, sequential);

    // ids are unique and follow input order
    let ids: Vec<usize> = parallel
        .iter()
        .flat_map(|targets| targets.assignments().iter().map(|a| a.instance_id))
        .collect();
    let expect: Vec<usize> = (100..(100 + ids.len())).collect();
    assert_eq!(ids, expect);

    // a cell is never claimed twice and a box never claims two cells per scale
    parallel.iter().for_each(|targets| {
        let total: usize = targets
            .assignments()
            .iter()
            .map(|assignment| assignment.num_claimed())
            .sum();
        assert_eq!(total, targets.num_positives());
    });
    Ok(())
}
