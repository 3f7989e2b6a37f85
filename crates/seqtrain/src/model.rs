//! Model collaborator contract.

use crate::batch::{Batch, TokenId};
use crate::{Result, SeqTrainError};
use ndarray::{ArrayD, Axis};
use std::collections::BTreeMap;

/// Dense tensor used for parameters, gradients and decoder outputs.
pub type Tensor = ArrayD<f32>;

/// Attention maps keyed by kind (`"std"`, `"copy"`, ...).
pub type Attentions = BTreeMap<String, Tensor>;

/// A trainable tensor together with its accumulated gradient.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: Tensor,
    pub grad: Option<Tensor>,
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            grad: None,
            requires_grad: true,
        }
    }

    /// Mark the parameter as frozen.
    pub fn frozen(mut self) -> Self {
        self.requires_grad = false;
        self
    }

    /// Add `grad` into the accumulated gradient.
    pub fn accumulate_grad(&mut self, grad: &Tensor) -> Result<()> {
        if grad.shape() != self.value.shape() {
            return Err(SeqTrainError::ShapeMismatch {
                expected: self.value.shape().to_vec(),
                actual: grad.shape().to_vec(),
            });
        }
        match self.grad {
            Some(ref mut acc) => *acc += grad,
            None => self.grad = Some(grad.clone()),
        }
        Ok(())
    }
}

/// Anything that exposes an ordered set of parameters.
///
/// The iteration order must be stable for the lifetime of the object: moving
/// averages and checkpoint payloads are index-aligned with it.
pub trait Parameterized {
    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.value.len()).sum()
    }
}

/// Sequence-generation model driven by the trainer.
///
/// `Clone` must produce an independent deep copy; the averaged validation path
/// overwrites the copy's parameters and discards it afterwards.
pub trait Model: Parameterized + Clone {
    /// Forward pass over `batch`, fed the gold target as decoder input.
    fn forward(&mut self, batch: &Batch) -> Result<ForwardOutput>;

    /// Toggle between training and inference mode.
    fn set_training(&mut self, training: bool);

    /// Whether a recurrent decoder state is currently carried.
    fn has_decoder_state(&self) -> bool {
        false
    }

    /// Cut the recurrent decoder state from the gradient history.
    fn detach_decoder_state(&mut self) {}
}

/// Result of [`Model::forward`].
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// Decoder outputs, `[tgt_len - 1, batch, hidden]`.
    pub outputs: Tensor,
    pub attentions: Attentions,
    /// Beam-search candidates, when the model decodes during training.
    pub beam: Option<BeamOutput>,
}

/// Beam-level decoder outputs plus their text reconstructions.
#[derive(Clone, Debug)]
pub struct BeamOutput {
    /// `[tgt_len - 1, batch, beam, hidden]`
    pub dec_outputs: Tensor,
    /// Each entry is `[tgt_len - 1, batch, beam, src_len]`.
    pub dec_attns: Attentions,
    /// One entry per example in the batch.
    pub decodings: Vec<ExampleDecoding>,
}

/// Decoded candidates and raw text for one example.
#[derive(Clone, Debug, Default)]
pub struct ExampleDecoding {
    /// Token ids per beam slot, start token excluded.
    pub token_ids: Vec<Vec<TokenId>>,
    /// Token strings per beam slot, end token excluded.
    pub tokens: Vec<Vec<String>>,
    pub source: Vec<String>,
    pub reference: Vec<String>,
}

impl BeamOutput {
    pub fn beam_size(&self) -> usize {
        self.dec_outputs.shape().get(2).copied().unwrap_or(0)
    }

    /// Outputs and attentions of beam slot `b`, shaped like [`ForwardOutput`].
    pub fn select(&self, b: usize) -> Result<(Tensor, Attentions)> {
        if self.dec_outputs.ndim() != 4 || b >= self.beam_size() {
            return Err(SeqTrainError::Model(format!(
                "beam slot {} out of range for outputs of shape {:?}",
                b,
                self.dec_outputs.shape()
            )));
        }
        let outputs = self.dec_outputs.index_axis(Axis(2), b).to_owned();
        let mut attns = Attentions::new();
        for (key, attn) in &self.dec_attns {
            if attn.ndim() != 4 || attn.shape()[2] <= b {
                return Err(SeqTrainError::Model(format!(
                    "attention '{}' has no beam slot {}",
                    key, b
                )));
            }
            attns.insert(key.clone(), attn.index_axis(Axis(2), b).to_owned());
        }
        Ok((outputs, attns))
    }
}
