use crate::core::train_config::TrainConfig;

/// Constant or staircase-decayed learning rate.
///
/// `rate_at(g) = base * factor^floor(g / (steps_per_epoch * every_epochs))`, where `g` is the
/// number of updates already applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    base: f64,
    decay: Option<(f64, usize)>,
}

impl LearningRateSchedule {
    pub fn constant(base: f64) -> Self {
        Self { base, decay: None }
    }

    pub fn staircase(base: f64, factor: f64, decay_steps: usize) -> Self {
        Self {
            base,
            decay: Some((factor, decay_steps.max(1))),
        }
    }

    pub fn from_config(config: &TrainConfig, steps_per_epoch: usize) -> Self {
        if config.decay_lr {
            Self::staircase(
                config.learning_rate,
                config.decay_factor,
                steps_per_epoch * config.decay_every_epochs,
            )
        } else {
            Self::constant(config.learning_rate)
        }
    }

    pub fn rate_at(&self, global_step: usize) -> f64 {
        match self.decay {
            None => self.base,
            Some((factor, decay_steps)) => {
                let exponent = (global_step / decay_steps) as i32;
                self.base * factor.powi(exponent)
            }
        }
    }
}
