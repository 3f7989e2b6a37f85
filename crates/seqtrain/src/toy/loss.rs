//! Cross entropy over a linear generator.

use super::decoder::{BIAS, WEIGHT};
use crate::batch::{Batch, TokenId};
use crate::model::{Attentions, Parameter, Parameterized, Tensor};
use crate::stats::Statistics;
use crate::training::{Loss, LossCompute, LossRequest};
use crate::{Result, SeqTrainError};
use ndarray::{s, Array1, Array2, Ix2};

/// `softmax(outputs . weight + bias)` scored against the batch target.
///
/// Works with any model exposing `generator.weight` `[hidden, vocab]` and
/// `generator.bias` `[vocab]`.
#[derive(Clone, Debug)]
pub struct GeneratorLoss {
    padding_idx: TokenId,
}

impl GeneratorLoss {
    pub fn new(padding_idx: TokenId) -> Self {
        Self { padding_idx }
    }
}

fn find(params: &[&Parameter], name: &str) -> Result<usize> {
    params
        .iter()
        .position(|p| p.name == name)
        .ok_or_else(|| SeqTrainError::Loss(format!("model has no '{}' parameter", name)))
}

impl<M: Parameterized> LossCompute<M> for GeneratorLoss {
    fn compute(
        &mut self,
        model: &M,
        batch: &Batch,
        outputs: &Tensor,
        _attentions: &Attentions,
        request: &LossRequest,
    ) -> Result<(Option<Loss>, Statistics)> {
        let params = model.parameters();
        let (w_idx, b_idx) = (find(&params, WEIGHT)?, find(&params, BIAS)?);
        let weight = params[w_idx]
            .value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|e| SeqTrainError::Loss(format!("generator weight: {}", e)))?;
        let bias = &params[b_idx].value;
        let (hidden, vocab) = weight.dim();

        let (steps, batch_size) = (batch.tgt_len().saturating_sub(1), batch.batch_size());
        let expected = [steps, batch_size, hidden];
        if outputs.shape() != expected {
            return Err(SeqTrainError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: outputs.shape().to_vec(),
            });
        }
        if let Some(ref scales) = request.scales {
            if scales.len() != batch_size {
                return Err(SeqTrainError::Contract(format!(
                    "{} loss scales for {} examples",
                    scales.len(),
                    batch_size
                )));
            }
        }

        let normalization = request.normalization.max(1.0);
        let start = request.trunc_start.min(steps);
        let end = (request.trunc_start + request.trunc_size.saturating_sub(1)).min(steps);
        let shard = if request.shard_size == 0 {
            (end - start).max(1)
        } else {
            request.shard_size
        };

        let mut grad_w = Array2::<f32>::zeros((hidden, vocab));
        let mut grad_b = Array1::<f32>::zeros(vocab);
        let mut stats = Statistics::new();
        let mut value = 0.0f64;

        let mut shard_start = start;
        while shard_start < end {
            let shard_end = (shard_start + shard).min(end);
            for t in shard_start..shard_end {
                for b in 0..batch_size {
                    let target = batch.tgt()[[t + 1, b, 0]];
                    if target == self.padding_idx {
                        continue;
                    }
                    let y = target as usize;
                    if y >= vocab {
                        return Err(SeqTrainError::Loss(format!(
                            "target {} is outside a vocabulary of {}",
                            target, vocab
                        )));
                    }

                    let h = outputs.slice(s![t, b, ..]);
                    let mut logits = h.dot(&weight);
                    logits.zip_mut_with(bias, |l, &bias| *l += bias);
                    let max = logits.fold(f32::NEG_INFINITY, |m, &l| m.max(l));
                    let mut probs = logits.mapv(|l| (l - max).exp());
                    let total = probs.sum();
                    probs /= total;

                    let nll = -(probs[y].max(f32::MIN_POSITIVE) as f64).ln();
                    let predicted = probs
                        .iter()
                        .enumerate()
                        .fold((0, f32::NEG_INFINITY), |best, (i, &p)| {
                            if p > best.1 {
                                (i, p)
                            } else {
                                best
                            }
                        })
                        .0;

                    let scale = request.scales.as_ref().map_or(1.0, |s| s[b]);
                    stats.loss += nll;
                    stats.n_words += 1;
                    stats.n_correct += u64::from(predicted == y);
                    value += scale as f64 * nll / normalization;

                    let coef = scale / normalization as f32;
                    let mut dlogits = probs;
                    dlogits[y] -= 1.0;
                    dlogits *= coef;
                    for (i, &hi) in h.iter().enumerate() {
                        if hi != 0.0 {
                            grad_w.row_mut(i).scaled_add(hi, &dlogits);
                        }
                    }
                    grad_b += &dlogits;
                }
            }
            shard_start = shard_end;
        }

        if stats.n_words == 0 {
            return Ok((None, stats));
        }

        let mut gradients: Vec<Option<Tensor>> = vec![None; params.len()];
        gradients[w_idx] = Some(grad_w.into_dyn());
        gradients[b_idx] = Some(grad_b.into_dyn());
        Ok((Some(Loss { value, gradients }), stats))
    }
}
