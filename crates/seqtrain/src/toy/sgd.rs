//! Plain stochastic gradient descent.

use crate::model::Parameterized;
use crate::training::{clip_grad_norm, Optimizer};
use crate::Result;

/// Constant learning rate, optional global-norm clipping.
///
/// RL-flagged steps use `learning_rate * rl_scale` and are counted apart
/// from supervised steps; only the latter advance [`Optimizer::training_step`].
#[derive(Clone, Debug)]
pub struct Sgd {
    learning_rate: f64,
    rl_scale: f64,
    max_grad_norm: Option<f64>,
    steps: u64,
    rl_steps: u64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            rl_scale: 1.0,
            max_grad_norm: None,
            steps: 0,
            rl_steps: 0,
        }
    }

    pub fn with_rl_scale(mut self, scale: f64) -> Self {
        self.rl_scale = scale;
        self
    }

    pub fn with_max_grad_norm(mut self, max_norm: f64) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    /// Resume counting from `step`.
    pub fn with_start_step(mut self, step: u64) -> Self {
        self.steps = step;
        self
    }

    pub fn rl_steps(&self) -> u64 {
        self.rl_steps
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &mut dyn Parameterized, rl: bool) -> Result<()> {
        if let Some(max_norm) = self.max_grad_norm {
            let norm = clip_grad_norm(model, max_norm);
            tracing::trace!(norm, max_norm, "Gradient norm");
        }

        let lr = if rl {
            self.learning_rate * self.rl_scale
        } else {
            self.learning_rate
        };
        for param in model.parameters_mut() {
            if !param.requires_grad {
                continue;
            }
            if let Some(ref grad) = param.grad {
                param.value.scaled_add(-lr as f32, grad);
            }
        }

        if rl {
            self.rl_steps += 1;
        } else {
            self.steps += 1;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn training_step(&self) -> u64 {
        self.steps
    }
}
