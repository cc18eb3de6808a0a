//! Defines loss for training.

use super::{
    bce_with_logit_loss::{BceWithLogitsLoss, BceWithLogitsLossInit},
    decode::decode_boxes,
};
use crate::{
    anchors::{AnchorSet, ScaleDescriptor},
    assign::{stack_targets, ImageTargets, TargetAssignerInit, TARGET_ENTRIES},
    common::*,
    config::{Lambdas, LossConfig, ANCHORS_PER_SCALE, NUM_SCALES},
    counter::InstanceCounter,
    label::labels_from_tensor,
    profiling::{LossTiming, Stage},
};
use tch_goodies::{BoxFormat, BoxOverlap, BoxOverlapInit};

pub use yolo_loss::*;
pub use yolo_loss_output::*;

mod yolo_loss {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct YoloLossInit {
        pub config: LossConfig,
    }

    impl YoloLossInit {
        pub fn build(self) -> Result<YoloLoss> {
            let Self { config } = self;
            config.validate()?;

            let device = config.device;
            let anchors = config.anchor_set()?;
            let lambdas = config.lambdas();

            let box_overlap = BoxOverlapInit {
                format: BoxFormat::CxCyWH,
                kind: config.iou_kind,
                epsilon: config.epsilon.raw(),
                device,
            }
            .build()?;

            let bce_objectness = BceWithLogitsLossInit {
                pos_weight: config.objectness_pos_weight.map(|weight| weight.raw()),
                ..BceWithLogitsLossInit::default(Reduction::Mean)
            }
            .build(device)?;

            let bce_class = BceWithLogitsLossInit {
                pos_weight: config.classification_pos_weight.map(|weight| weight.raw()),
                ..BceWithLogitsLossInit::default(Reduction::Mean)
            }
            .build(device)?;

            info!(
                "loss weights: box {:.4}, objectness {:.4}, classification {:.4}",
                lambdas.r#box, lambdas.objectness, lambdas.classification
            );

            Ok(YoloLoss {
                config,
                anchors,
                lambdas,
                box_overlap,
                bce_objectness,
                bce_class,
            })
        }
    }

    #[derive(Debug)]
    pub struct YoloLoss {
        config: LossConfig,
        anchors: AnchorSet,
        lambdas: Lambdas,
        box_overlap: BoxOverlap,
        bce_objectness: BceWithLogitsLoss,
        bce_class: BceWithLogitsLoss,
    }

    impl YoloLoss {
        pub fn config(&self) -> &LossConfig {
            &self.config
        }

        pub fn lambdas(&self) -> Lambdas {
            self.lambdas
        }

        /// Assign targets for a padded label batch and compute the loss.
        ///
        /// `predictions` holds one `[batch, 3, height, width, 5 + classes]`
        /// raw tensor per scale, finest first. `labels` is the
        /// `[batch, max_boxes, 5]` padded label tensor. Instance ids are drawn
        /// from `counter`.
        pub fn forward(
            &self,
            predictions: &[Tensor],
            labels: &Tensor,
            counter: &InstanceCounter,
        ) -> Result<(YoloLossOutput, YoloLossAuxiliary)> {
            let mut timing = LossTiming::start();

            let device = self.config.device;
            labels.ensure_device(device)?;
            let (scales, batch_size) = self.check_predictions(predictions)?;

            let batch = labels_from_tensor(labels)?;
            ensure!(
                batch.len() as i64 == batch_size,
                "the label batch size {} does not match the prediction batch size {}",
                batch.len(),
                batch_size
            );
            timing.finish(Stage::DecodeLabels);

            let assigner = TargetAssignerInit {
                anchors: self.anchors.clone(),
                scales: scales.clone(),
                image_size: self.config.image_size,
                num_classes: self.config.num_classes,
            }
            .build()?;
            let image_targets = assigner.assign_batch(&batch, counter)?;
            timing.finish(Stage::AssignTargets);

            let targets: Vec<Tensor> = (0..NUM_SCALES)
                .map(|scale| stack_targets(&image_targets, scale, device))
                .collect::<Result<_>>()?;
            timing.finish(Stage::StackTargets);

            let output = self.compute(predictions, &targets, &scales, batch_size, &mut timing)?;
            timing.report(batch_size);

            let num_positives = output
                .per_scale
                .iter()
                .map(|scale| scale.num_positives)
                .collect();

            Ok((
                output,
                YoloLossAuxiliary {
                    targets: image_targets,
                    num_positives,
                },
            ))
        }

        /// Compute the loss against stacked `[batch, 3, height, width, 6]` targets.
        pub fn forward_targets(
            &self,
            predictions: &[Tensor],
            targets: &[Tensor],
        ) -> Result<YoloLossOutput> {
            let (scales, batch_size) = self.check_predictions(predictions)?;
            let mut timing = LossTiming::start();
            let output = self.compute(predictions, targets, &scales, batch_size, &mut timing)?;
            timing.report(batch_size);
            Ok(output)
        }

        /// Per-scale losses and their weighted sum over checked predictions.
        fn compute(
            &self,
            predictions: &[Tensor],
            targets: &[Tensor],
            scales: &[ScaleDescriptor],
            batch_size: i64,
            timing: &mut LossTiming,
        ) -> Result<YoloLossOutput> {
            let device = self.config.device;
            ensure!(
                targets.len() == NUM_SCALES,
                "expect {} target tensors, but get {}",
                NUM_SCALES,
                targets.len()
            );

            let per_scale: Vec<ScaleLoss> = izip!(0.., predictions, targets, scales)
                .map(|(scale_index, prediction, target, scale)| -> Result<_> {
                    let loss = self
                        .scale_loss(scale_index, scale, prediction, target)
                        .with_context(|| format!("unable to compute loss at scale {}", scale_index))?;
                    timing.finish(Stage::ScaleLoss(scale_index));
                    Ok(loss)
                })
                .collect::<Result<_>>()?;

            let Lambdas {
                r#box: box_lambda,
                objectness: objectness_lambda,
                classification: classification_lambda,
            } = self.lambdas;
            let batch_factor = batch_size as f64;
            let zero = Tensor::zeros(&[], (predictions[0].kind(), device));

            let (box_loss, objectness_loss, classification_loss) = per_scale.iter().fold(
                (
                    zero.shallow_clone(),
                    zero.shallow_clone(),
                    zero.shallow_clone(),
                ),
                |(box_sum, objectness_sum, classification_sum), scale| {
                    (
                        box_sum + &scale.box_loss * (box_lambda * batch_factor),
                        objectness_sum
                            + &scale.objectness_loss * (objectness_lambda * batch_factor),
                        classification_sum
                            + &scale.classification_loss * (classification_lambda * batch_factor),
                    )
                },
            );
            let total_loss = &box_loss + &objectness_loss + &classification_loss;
            timing.finish(Stage::Combine);

            Ok(YoloLossOutput {
                total_loss,
                box_loss,
                objectness_loss,
                classification_loss,
                per_scale,
            })
        }

        /// Validate predictions and read their grid sizes and batch size.
        fn check_predictions(&self, predictions: &[Tensor]) -> Result<(Vec<ScaleDescriptor>, i64)> {
            let device = self.config.device;
            let num_entries = 5 + self.config.num_classes as i64;

            ensure!(
                predictions.len() == NUM_SCALES,
                "expect {} prediction tensors, but get {}",
                NUM_SCALES,
                predictions.len()
            );

            let scales: Vec<ScaleDescriptor> = izip!(predictions, &self.config.strides)
                .map(|(prediction, &stride)| -> Result<_> {
                    prediction.ensure_device(device)?;
                    let scale = ScaleDescriptor::from_prediction(prediction, stride)?;
                    ensure!(
                        prediction.size()[4] == num_entries,
                        "expect {} entries per cell, but get shape {:?}",
                        num_entries,
                        prediction.size()
                    );
                    Ok(scale)
                })
                .collect::<Result<_>>()?;

            let batch_size = predictions[0].size()[0];
            ensure!(batch_size > 0, "the batch must not be empty");
            ensure!(
                predictions
                    .iter()
                    .all(|prediction| prediction.size()[0] == batch_size),
                "predictions have different batch sizes"
            );

            Ok((scales, batch_size))
        }

        fn scale_loss(
            &self,
            scale_index: usize,
            scale: &ScaleDescriptor,
            prediction: &Tensor,
            target: &Tensor,
        ) -> Result<ScaleLoss> {
            let device = self.config.device;
            let num_classes = self.config.num_classes as i64;
            let kind = prediction.kind();
            let batch_size = prediction.size()[0];
            let num_anchors = ANCHORS_PER_SCALE as i64;
            let grid_h = scale.grid_h as i64;
            let grid_w = scale.grid_w as i64;

            target.ensure_device(device)?;
            ensure!(
                target.size()
                    == vec![
                        batch_size,
                        num_anchors,
                        grid_h,
                        grid_w,
                        TARGET_ENTRIES as i64
                    ],
                "expect a [{}, {}, {}, {}, {}] target, but get shape {:?}",
                batch_size,
                num_anchors,
                grid_h,
                grid_w,
                TARGET_ENTRIES,
                target.size()
            );

            // flatten to one row per (image, anchor, row, col)
            let prediction = prediction.reshape(&[-1, 5 + num_classes]);
            let target = target.to_kind(kind).reshape(&[-1, TARGET_ENTRIES as i64]);
            let anchors = self
                .anchors
                .to_tensor(scale_index, scale.stride, device)
                .to_kind(kind)
                .view([1, num_anchors, 1, 1, 2])
                .expand(&[batch_size, num_anchors, grid_h, grid_w, 2], false)
                .reshape(&[-1, 2]);

            let target_objectness = target.select(1, 4);
            let positive_index = target_objectness.gt(0.5).nonzero().view([-1]);
            let num_positives = positive_index.size()[0];

            let (box_loss, classification_loss, objectness_target) = if num_positives > 0 {
                let pos_prediction = prediction.index_select(0, &positive_index);
                let pos_target = target.index_select(0, &positive_index);
                let pos_anchors = anchors.index_select(0, &positive_index);

                let pred_boxes = decode_boxes(&pos_prediction, &pos_anchors)?;
                let target_boxes = pos_target.narrow(1, 0, 4);
                let score = self.box_overlap.forward(&pred_boxes, &target_boxes)?;
                let box_loss = (1.0f64 - &score).mean(kind);

                // positive objectness becomes the match quality
                let quality = target_objectness.ones_like().index_copy(
                    0,
                    &positive_index,
                    &score.detach().clamp_min(0.0),
                );
                let objectness_target = &target_objectness * quality;

                let class_ids = pos_target.select(1, 5).to_kind(Kind::Int64);
                ensure!(
                    bool::from(class_ids.ge(0i64).logical_and(&class_ids.lt(num_classes)).all()),
                    "target class ids must be in range [0, {})",
                    num_classes
                );
                let class_target = class_ids.one_hot(num_classes).to_kind(kind);
                let class_logits = pos_prediction.narrow(1, 5, num_classes);
                let classification_loss = self.bce_class.forward(&class_logits, &class_target)?;

                (box_loss, classification_loss, objectness_target)
            } else {
                // nothing to localize or classify at this scale
                let zero = Tensor::zeros(&[], (kind, device));
                (
                    zero.shallow_clone(),
                    zero,
                    target_objectness.shallow_clone(),
                )
            };

            let balance = self.config.balance[scale_index].raw();
            let objectness_loss = self
                .bce_objectness
                .forward(&prediction.select(1, 4), &objectness_target)?
                * balance;

            let Lambdas {
                r#box: box_lambda,
                objectness: objectness_lambda,
                classification: classification_lambda,
            } = self.lambdas;
            let total_loss = (&box_loss * box_lambda
                + &objectness_loss * objectness_lambda
                + &classification_loss * classification_lambda)
                * batch_size as f64;

            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "scale {}: {} positives, box {:.5}, objectness {:.5}, classification {:.5}",
                    scale_index,
                    num_positives,
                    box_loss.double_value(&[]),
                    objectness_loss.double_value(&[]),
                    classification_loss.double_value(&[])
                );
            }

            Ok(ScaleLoss {
                total_loss,
                box_loss,
                objectness_loss,
                classification_loss,
                num_positives,
            })
        }
    }
}

mod yolo_loss_output {
    use super::*;

    /// The loss terms of one scale.
    ///
    /// The box and classification terms are plain means. The objectness term
    /// already carries the scale balance, and `total_loss` applies the lambdas
    /// and the batch size.
    #[derive(Debug, TensorLike)]
    pub struct ScaleLoss {
        /// The weighted sum of the terms times the batch size.
        pub total_loss: Tensor,
        /// Mean of `1 - IoU` over positive cells.
        pub box_loss: Tensor,
        /// Objectness BCE over all cells, scaled by the scale balance.
        pub objectness_loss: Tensor,
        /// Class BCE over positive cells.
        pub classification_loss: Tensor,
        #[tensor_like(copy)]
        pub num_positives: i64,
    }

    /// The loss summed over scales.
    ///
    /// Each term is already weighted and multiplied by the batch size, so the
    /// terms add up to `total_loss`.
    #[derive(Debug, TensorLike)]
    pub struct YoloLossOutput {
        pub total_loss: Tensor,
        pub box_loss: Tensor,
        pub objectness_loss: Tensor,
        pub classification_loss: Tensor,
        pub per_scale: Vec<ScaleLoss>,
    }

    impl YoloLossOutput {
        pub fn is_finite(&self) -> bool {
            [
                &self.total_loss,
                &self.box_loss,
                &self.objectness_loss,
                &self.classification_loss,
            ]
            .iter()
            .all(|loss| bool::from(loss.isfinite().all()))
        }
    }

    /// Side products of a loss computation.
    #[derive(Debug)]
    pub struct YoloLossAuxiliary {
        /// The assigned targets of each image.
        pub targets: Vec<ImageTargets>,
        /// The positive cell count of each scale.
        pub num_positives: Vec<i64>,
    }
}
