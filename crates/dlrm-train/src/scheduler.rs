use crate::config::TrainingConfig;
use crate::error::TrainError;

const MIN_DECAY_LR: f32 = 1e-7;

/// Learning rate as a function of the step count.
///
/// Linear warmup over the first `warmup_steps` steps, the base rate until `decay_start`, then a
/// quadratic decay over `decay_steps` steps, frozen at its last value once finished.
#[derive(Clone, Debug, PartialEq)]
pub struct LrPolicy {
    base_lr: f32,
    warmup_steps: usize,
    decay_start: usize,
    decay_steps: usize,
}

impl LrPolicy {
    /// Fails if the decay starts before the warmup has finished.
    pub fn new(
        base_lr: f32,
        warmup_steps: usize,
        decay_start: usize,
        decay_steps: usize,
    ) -> Result<Self, TrainError> {
        if decay_start < warmup_steps {
            return Err(TrainError::InvalidConfig(format!(
                "learning rate decay starts at step {decay_start}, before warmup ends at step {warmup_steps}"
            )));
        }
        Ok(Self {
            base_lr,
            warmup_steps,
            decay_start,
            decay_steps,
        })
    }

    /// Policy of the training configuration.
    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainError> {
        Self::new(
            config.learning_rate,
            config.lr_num_warmup_steps,
            config.lr_decay_start_step,
            config.lr_num_decay_steps,
        )
    }

    /// The base learning rate.
    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }

    /// Learning rate of `step`, counted from 1.
    pub fn lr_at(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            let remaining = (self.warmup_steps - step) as f32 / self.warmup_steps as f32;
            return self.base_lr * (1.0 - remaining);
        }

        let decay_end = self.decay_start + self.decay_steps;
        if self.decay_steps == 0 || step < self.decay_start {
            return self.base_lr;
        }
        // The last decayed value is reused after the window.
        let step = step.min(decay_end - 1);
        let remaining = (decay_end - step) as f32 / self.decay_steps as f32;
        (self.base_lr * remaining * remaining).max(MIN_DECAY_LR)
    }
}
