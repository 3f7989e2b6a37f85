//! Loss computation contract.

use crate::batch::Batch;
use crate::model::{Attentions, Parameterized, Tensor};
use crate::stats::Statistics;
use crate::Result;

/// A differentiated loss.
///
/// Gradients are materialized by the loss computation and index-aligned with
/// [`Parameterized::parameters`]; `None` means the parameter received no
/// gradient from this loss.
#[derive(Clone, Debug)]
pub struct Loss {
    pub value: f64,
    pub gradients: Vec<Option<Tensor>>,
}

/// Per-call options for [`LossCompute::compute`].
#[derive(Clone, Debug, PartialEq)]
pub struct LossRequest {
    /// Divisor turning the summed loss into a per-unit loss.
    pub normalization: f64,
    /// Compute in shards of this many time steps (0 disables sharding).
    pub shard_size: usize,
    pub trunc_start: usize,
    pub trunc_size: usize,
    /// Per-example multiplicative weights.
    pub scales: Option<Vec<f32>>,
}

impl LossRequest {
    /// Full-sequence request for a training batch.
    pub fn training(batch: &Batch, normalization: usize, shard_size: usize) -> Self {
        Self {
            normalization: normalization as f64,
            shard_size,
            trunc_start: 0,
            trunc_size: batch.tgt_len(),
            scales: None,
        }
    }

    /// Unsharded, unnormalized request used for validation.
    pub fn validation(batch: &Batch) -> Self {
        Self {
            normalization: 1.0,
            shard_size: 0,
            trunc_start: 0,
            trunc_size: batch.tgt_len(),
            scales: None,
        }
    }

    pub fn with_scales(mut self, scales: Vec<f32>) -> Self {
        self.scales = Some(scales);
        self
    }
}

/// Turns decoder outputs into a loss and statistics.
pub trait LossCompute<M: Parameterized> {
    /// Score `outputs` against `batch`'s current target.
    ///
    /// Returns `None` for the loss when there is nothing to backpropagate.
    fn compute(
        &mut self,
        model: &M,
        batch: &Batch,
        outputs: &Tensor,
        attentions: &Attentions,
        request: &LossRequest,
    ) -> Result<(Option<Loss>, Statistics)>;
}
