//! Loss function configuration format.

use crate::{anchors::AnchorSet, common::*};
use tch_goodies::IoUKind;

/// Number of detection scales the loss is laid out for.
pub const NUM_SCALES: usize = 3;

/// Number of anchors predicted at each grid cell.
pub const ANCHORS_PER_SCALE: usize = 3;

const DEFAULT_ANCHORS: [[f64; 2]; NUM_SCALES * ANCHORS_PER_SCALE] = [
    [10.0, 13.0],
    [16.0, 30.0],
    [33.0, 23.0],
    [30.0, 61.0],
    [62.0, 45.0],
    [59.0, 119.0],
    [116.0, 90.0],
    [156.0, 198.0],
    [373.0, 326.0],
];

/// The loss function configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    /// The reference input image size in pixels.
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// The number of object classes.
    pub num_classes: usize,
    /// The `[width, height]` anchor pairs, finest scale first.
    #[serde(default = "default_anchors")]
    pub anchors: Vec<[R64; 2]>,
    /// If set, anchors are stride-divided and are scaled back by their stride.
    #[serde(default)]
    pub anchors_in_grid_units: bool,
    /// The stride of each scale, finest first.
    #[serde(default = "default_strides")]
    pub strides: Vec<usize>,
    /// The objectness weight of each scale.
    #[serde(default = "default_balance")]
    pub balance: Vec<R64>,
    /// The reference weight of the box loss.
    #[serde(default = "default_box_weight")]
    pub box_weight: R64,
    /// The reference weight of the objectness loss.
    #[serde(default = "default_objectness_weight")]
    pub objectness_weight: R64,
    /// The reference weight of the classification loss.
    #[serde(default = "default_classification_weight")]
    pub classification_weight: R64,
    /// The weight factor of positive objectness.
    #[serde(default)]
    pub objectness_pos_weight: Option<R64>,
    /// The weight factor of positive classes.
    #[serde(default)]
    pub classification_pos_weight: Option<R64>,
    /// The box metric of the localization loss.
    #[serde(default = "default_iou_kind")]
    pub iou_kind: IoUKind,
    /// The term added to overlap denominators.
    #[serde(default = "default_epsilon")]
    pub epsilon: R64,
    /// The device where targets and losses are computed.
    #[serde(with = "tch_serde::serde_device", default = "default_device")]
    pub device: Device,
}

/// The scale-adjusted weights of the three loss terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lambdas {
    pub r#box: f64,
    pub objectness: f64,
    pub classification: f64,
}

impl LossConfig {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read config file '{}'", path.display()))?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// A configuration with reference hyperparameters for `num_classes` classes.
    pub fn new(num_classes: usize) -> Self {
        Self {
            image_size: default_image_size(),
            num_classes,
            anchors: default_anchors(),
            anchors_in_grid_units: false,
            strides: default_strides(),
            balance: default_balance(),
            box_weight: default_box_weight(),
            objectness_weight: default_objectness_weight(),
            classification_weight: default_classification_weight(),
            objectness_pos_weight: None,
            classification_pos_weight: None,
            iou_kind: default_iou_kind(),
            epsilon: default_epsilon(),
            device: default_device(),
        }
    }

    pub fn num_scales(&self) -> usize {
        self.strides.len()
    }

    /// Rescale the reference weights to this image size, class count and scale count.
    pub fn lambdas(&self) -> Lambdas {
        let scale_factor = NUM_SCALES as f64 / self.num_scales() as f64;
        let image_factor = self.image_size as f64 / 640.0;
        let class_factor = self.num_classes as f64 / 80.0;

        Lambdas {
            r#box: self.box_weight.raw() * scale_factor,
            objectness: self.objectness_weight.raw() * image_factor.powi(2) * scale_factor,
            classification: self.classification_weight.raw() * class_factor * scale_factor,
        }
    }

    /// Build the anchor set in pixel units.
    pub fn anchor_set(&self) -> Result<AnchorSet> {
        let pairs: Vec<[f64; 2]> = self
            .anchors
            .iter()
            .map(|&[w, h]| [w.raw(), h.raw()])
            .collect();

        if self.anchors_in_grid_units {
            AnchorSet::from_grid_units(&pairs, &self.strides)
        } else {
            AnchorSet::new(&pairs)
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.image_size > 0, "image_size must be positive");
        ensure!(self.num_classes > 0, "num_classes must be positive");
        ensure!(
            self.strides.len() == NUM_SCALES,
            "expect {} strides, but get {}",
            NUM_SCALES,
            self.strides.len()
        );
        ensure!(
            self.strides.iter().all(|&stride| stride > 0),
            "strides must be positive"
        );
        ensure!(
            self.balance.len() == NUM_SCALES,
            "expect {} balance values, but get {}",
            NUM_SCALES,
            self.balance.len()
        );
        ensure!(
            self.balance.iter().all(|value| value.raw() >= 0.0),
            "balance values must be non-negative"
        );
        ensure!(self.box_weight.raw() >= 0.0, "box_weight must be non-negative");
        ensure!(
            self.objectness_weight.raw() >= 0.0,
            "objectness_weight must be non-negative"
        );
        ensure!(
            self.classification_weight.raw() >= 0.0,
            "classification_weight must be non-negative"
        );
        ensure!(
            self.objectness_pos_weight
                .map(|weight| weight.raw() > 0.0)
                .unwrap_or(true),
            "objectness_pos_weight must be positive"
        );
        ensure!(
            self.classification_pos_weight
                .map(|weight| weight.raw() > 0.0)
                .unwrap_or(true),
            "classification_pos_weight must be positive"
        );
        ensure!(self.epsilon.raw() >= 0.0, "epsilon must be non-negative");

        // checks the anchor count and values
        self.anchor_set()?;

        Ok(())
    }
}

fn default_image_size() -> usize {
    640
}

fn default_anchors() -> Vec<[R64; 2]> {
    DEFAULT_ANCHORS
        .iter()
        .map(|&[w, h]| [r64(w), r64(h)])
        .collect()
}

fn default_strides() -> Vec<usize> {
    vec![8, 16, 32]
}

fn default_balance() -> Vec<R64> {
    vec![r64(4.0), r64(1.0), r64(0.4)]
}

fn default_box_weight() -> R64 {
    r64(0.05)
}

fn default_objectness_weight() -> R64 {
    r64(1.0)
}

fn default_classification_weight() -> R64 {
    r64(0.5)
}

fn default_iou_kind() -> IoUKind {
    IoUKind::GIoU
}

fn default_epsilon() -> R64 {
    r64(tch_goodies::EPSILON)
}

fn default_device() -> Device {
    Device::Cpu
}
