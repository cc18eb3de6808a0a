use crate::common::*;

#[derive(Debug)]
pub struct BceWithLogitsLossInit {
    pub pos_weight: Option<f64>,
    pub reduction: Reduction,
}

impl BceWithLogitsLossInit {
    pub fn default(reduction: Reduction) -> Self {
        Self {
            pos_weight: None,
            reduction,
        }
    }

    pub fn build(self, device: Device) -> Result<BceWithLogitsLoss> {
        let Self {
            pos_weight,
            reduction,
        } = self;

        if let Some(pos_weight) = pos_weight {
            ensure!(
                pos_weight.is_finite() && pos_weight > 0.0,
                "pos_weight must be positive"
            );
        }

        let pos_weight =
            pos_weight.map(|weight| Tensor::of_slice(&[weight as f32]).to_device(device));

        Ok(BceWithLogitsLoss {
            pos_weight,
            reduction,
        })
    }
}

#[derive(Debug)]
pub struct BceWithLogitsLoss {
    pos_weight: Option<Tensor>,
    reduction: Reduction,
}

impl BceWithLogitsLoss {
    pub fn forward(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.size() == target.size(),
            "input and target tensors must have equal shape, but get {:?} and {:?}",
            input.size(),
            target.size()
        );
        debug_assert!(
            bool::from(target.ge(0.0).logical_and(&target.le(1.0)).all()),
            "target values must be in range of [0.0, 1.0]"
        );

        // mean over nothing is zero rather than NaN
        if input.is_empty() && self.reduction == Reduction::Mean {
            return Ok(Tensor::zeros(&[], (input.kind(), input.device())));
        }

        Ok(input.binary_cross_entropy_with_logits(
            target,
            None::<&Tensor>,
            self.pos_weight.as_ref(),
            self.reduction,
        ))
    }
}
