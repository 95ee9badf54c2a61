//! Losses over the click probabilities, mean-reduced over the local batch.

use ndarray::{Array2, Zip};

use crate::config::{LossFunction, TrainingConfig};

const LOG_FLOOR: f32 = -100.0;
const BCE_GRAD_EPS: f32 = 1e-12;

/// Training objective.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Loss {
    /// `mean((p - t)²)`.
    Mse,
    /// `mean(-(t·ln p + (1 - t)·ln(1 - p)))`, logs floored at -100.
    Bce,
    /// Binary cross-entropy scaled by `weights[t]` per sample.
    Wbce {
        /// Weights of the negative and positive class.
        weights: [f32; 2],
    },
}

impl Loss {
    /// The loss selected by the training configuration.
    pub fn from_config(config: &TrainingConfig) -> Self {
        match config.loss_function {
            LossFunction::Mse => Loss::Mse,
            LossFunction::Bce => Loss::Bce,
            LossFunction::Wbce => Loss::Wbce {
                weights: config.loss_weights,
            },
        }
    }

    /// Mean loss of `pred` against `target`.
    pub fn forward(&self, pred: &Array2<f32>, target: &Array2<f32>) -> f32 {
        let n = pred.len().max(1) as f32;
        let total = Zip::from(pred)
            .and(target)
            .fold(0.0, |acc, &p, &t| acc + self.sample_loss(p, t));
        total / n
    }

    /// Gradient of [`Loss::forward`] with respect to `pred`.
    pub fn backward(&self, pred: &Array2<f32>, target: &Array2<f32>) -> Array2<f32> {
        let n = pred.len().max(1) as f32;
        Zip::from(pred)
            .and(target)
            .map_collect(|&p, &t| self.sample_grad(p, t) / n)
    }

    fn sample_loss(&self, p: f32, t: f32) -> f32 {
        match self {
            Loss::Mse => (p - t) * (p - t),
            Loss::Bce => bce(p, t),
            Loss::Wbce { weights } => class_weight(weights, t) * bce(p, t),
        }
    }

    fn sample_grad(&self, p: f32, t: f32) -> f32 {
        match self {
            Loss::Mse => 2.0 * (p - t),
            Loss::Bce => bce_grad(p, t),
            Loss::Wbce { weights } => class_weight(weights, t) * bce_grad(p, t),
        }
    }
}

fn bce(p: f32, t: f32) -> f32 {
    let log_p = p.ln().max(LOG_FLOOR);
    let log_q = (1.0 - p).ln().max(LOG_FLOOR);
    -(t * log_p + (1.0 - t) * log_q)
}

fn bce_grad(p: f32, t: f32) -> f32 {
    (p - t) / ((1.0 - p) * p).max(BCE_GRAD_EPS)
}

fn class_weight(weights: &[f32; 2], t: f32) -> f32 {
    weights[(t as usize).min(1)]
}

/// Clamps predictions to `[threshold, 1 - threshold]` when `0 < threshold < 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputClamp {
    threshold: Option<f32>,
}

impl OutputClamp {
    /// Clamp for `threshold`. Values outside `(0, 1)` disable it.
    pub fn new(threshold: f32) -> Self {
        let threshold = (threshold > 0.0 && threshold < 1.0).then_some(threshold);
        Self { threshold }
    }

    /// Whether the clamp changes anything.
    pub fn is_active(&self) -> bool {
        self.threshold.is_some()
    }

    /// Clamped predictions.
    pub fn apply(&self, pred: &Array2<f32>) -> Array2<f32> {
        match self.threshold {
            Some(th) => pred.mapv(|p| p.clamp(th, 1.0 - th)),
            None => pred.clone(),
        }
    }

    /// Gradient with respect to the unclamped `pred`. Clamped entries receive none.
    pub fn backward(&self, pred: &Array2<f32>, grad: &Array2<f32>) -> Array2<f32> {
        match self.threshold {
            Some(th) => Zip::from(pred).and(grad).map_collect(|&p, &g| {
                if (th..=1.0 - th).contains(&p) {
                    g
                } else {
                    0.0
                }
            }),
            None => grad.clone(),
        }
    }
}

/// Number of predictions that round to their target.
pub fn correct_predictions(pred: &Array2<f32>, target: &Array2<f32>) -> usize {
    Zip::from(pred)
        .and(target)
        .fold(0, |acc, &p, &t| acc + usize::from(p.round_ties_even() == t))
}
