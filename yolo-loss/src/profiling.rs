//! Stage timing of loss evaluations.
//!
//! Without the `profiling` feature every call compiles to a no-op.

use crate::common::*;
use std::fmt;

pub use timing::*;

/// A step of one loss evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    DecodeLabels,
    AssignTargets,
    StackTargets,
    ScaleLoss(usize),
    Combine,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DecodeLabels => write!(f, "decode_labels"),
            Self::AssignTargets => write!(f, "assign_targets"),
            Self::StackTargets => write!(f, "stack_targets"),
            Self::ScaleLoss(scale) => write!(f, "scale_{}_loss", scale),
            Self::Combine => write!(f, "combine"),
        }
    }
}

/// Settings read from `YOLO_LOSS_*` environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProfilingConfig {
    /// Evaluations faster than this are not reported.
    #[serde(default)]
    pub profiling_min_millis: u64,
}

#[cfg(feature = "profiling")]
mod timing {
    use super::*;
    use dashmap::DashMap;
    use lazy_static::lazy_static;

    lazy_static! {
        static ref PROFILING_CONFIG: ProfilingConfig =
            envy::prefixed("YOLO_LOSS_")
                .from_env::<ProfilingConfig>()
                .unwrap_or_else(|err| {
                    warn!("invalid profiling environment variables, using defaults: {:?}", err);
                    ProfilingConfig::default()
                });
        static ref STAGE_TOTALS: DashMap<Stage, (Duration, usize)> = DashMap::new();
    }

    /// Wall-clock durations of the stages of one loss evaluation.
    #[derive(Debug)]
    pub struct LossTiming {
        last: Instant,
        stages: Vec<(Stage, Duration)>,
    }

    impl LossTiming {
        pub fn start() -> Self {
            Self {
                last: Instant::now(),
                stages: vec![],
            }
        }

        /// Close `stage` at the current instant.
        pub fn finish(&mut self, stage: Stage) {
            let now = Instant::now();
            self.stages.push((stage, now - self.last));
            self.last = now;
        }

        pub fn stages(&self) -> &[(Stage, Duration)] {
            &self.stages
        }

        pub fn total(&self) -> Duration {
            self.stages.iter().map(|(_, elapsed)| *elapsed).sum()
        }

        /// Add the stages to the process-wide totals and log the evaluation.
        pub fn report(&self, batch_size: i64) {
            self.stages.iter().for_each(|&(stage, elapsed)| {
                let mut entry = STAGE_TOTALS.entry(stage).or_insert((Duration::ZERO, 0));
                entry.0 += elapsed;
                entry.1 += 1;
            });

            let total = self.total();
            if total.as_millis() < PROFILING_CONFIG.profiling_min_millis as u128 {
                return;
            }

            let slowest = self
                .stages
                .iter()
                .max_by_key(|(_, elapsed)| *elapsed)
                .map(|(stage, elapsed)| format!("{} ({:?})", stage, elapsed))
                .unwrap_or_default();
            info!(
                "loss over {} images took {:?}, slowest stage {}",
                batch_size, total, slowest
            );
            self.stages.iter().for_each(|(stage, elapsed)| {
                debug!(
                    "- {}\t{:?}\t{:.1}%",
                    stage,
                    elapsed,
                    elapsed.as_secs_f64() / total.as_secs_f64().max(f64::MIN_POSITIVE) * 100.0
                );
            });
        }
    }

    /// Mean duration per stage over every reported evaluation.
    pub fn stage_means() -> Vec<(Stage, Duration)> {
        STAGE_TOTALS
            .iter()
            .map(|entry| {
                let (sum, count) = *entry.value();
                (*entry.key(), sum / count.max(1) as u32)
            })
            .collect()
    }
}

#[cfg(not(feature = "profiling"))]
mod timing {
    use super::*;

    #[derive(Debug)]
    pub struct LossTiming;

    impl LossTiming {
        pub fn start() -> Self {
            Self
        }

        pub fn finish(&mut self, _stage: Stage) {}

        pub fn stages(&self) -> &[(Stage, Duration)] {
            &[]
        }

        pub fn total(&self) -> Duration {
            Duration::ZERO
        }

        pub fn report(&self, _batch_size: i64) {}
    }

    pub fn stage_means() -> Vec<(Stage, Duration)> {
        vec![]
    }
}
