//! Abstract optimizer interface.

use super::loss::Loss;
use crate::model::Parameterized;
use crate::{Result, SeqTrainError};

/// Trait for back-end agnostic optimizers.
///
/// The optimizer owns the training step counter; the trainer only reads it.
pub trait Optimizer {
    /// Zero out gradients.
    fn zero_grad(&mut self, model: &mut dyn Parameterized) {
        for param in model.parameters_mut() {
            param.grad = None;
        }
    }

    /// Accumulate `loss`'s gradients into the model.
    fn backward(&mut self, model: &mut dyn Parameterized, loss: Loss) -> Result<()> {
        let mut params = model.parameters_mut();
        if loss.gradients.len() != params.len() {
            return Err(SeqTrainError::Optimizer(format!(
                "loss carries {} gradients for {} parameters",
                loss.gradients.len(),
                params.len()
            )));
        }
        for (param, grad) in params.iter_mut().zip(loss.gradients) {
            if let Some(grad) = grad {
                if param.requires_grad {
                    param.accumulate_grad(&grad)?;
                }
            }
        }
        Ok(())
    }

    /// Perform an optimization step. `rl` marks a step taken for the
    /// reward-shaped objective.
    fn step(&mut self, model: &mut dyn Parameterized, rl: bool) -> Result<()>;

    fn learning_rate(&self) -> f64;

    /// Number of steps taken so far.
    fn training_step(&self) -> u64;
}

/// Scale gradients so that their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(model: &mut dyn Parameterized, max_norm: f64) -> f64 {
    let mut global_norm = 0.0f64;
    for param in model.parameters() {
        if let Some(ref grad) = param.grad {
            global_norm += grad.iter().map(|&g| (g as f64).powi(2)).sum::<f64>();
        }
    }
    global_norm = global_norm.sqrt();

    if global_norm > max_norm {
        let clip_coef = (max_norm / (global_norm + 1e-6)) as f32;
        for param in model.parameters_mut() {
            if let Some(ref mut grad) = param.grad {
                grad.mapv_inplace(|g| g * clip_coef);
            }
        }
    }
    global_norm
}
