//! Reward-shaped RL objective over beam-search candidates.
//!
//! For every beam slot, each example's decoded candidate becomes a synthetic
//! target. An external evaluator scores the candidate against the reference
//! and the loss on that target is weighted by `1 - f1`, so candidates that
//! already score well push the model less than poor ones.

use super::loss::{LossCompute, LossRequest};
use super::optimizer::Optimizer;
use crate::batch::{Batch, TokenId};
use crate::model::{BeamOutput, Model};
use crate::{Result, SeqTrainError};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Scores returned by a [`RewardEvaluator`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RewardMetrics {
    pub f1: f64,
    pub exact_match: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    #[error("reward evaluator unavailable: {0}")]
    Unavailable(String),
    #[error("invalid reward input: {0}")]
    InvalidInput(String),
}

/// External scorer queried during RL fine-tuning. Calls may block.
pub trait RewardEvaluator: Send {
    fn evaluate(
        &mut self,
        source: &str,
        hypothesis: &str,
        reference: &str,
    ) -> core::result::Result<RewardMetrics, RewardError>;
}

/// Per-example loss weight, in `[0, 1]`.
pub fn reward_scale(metrics: &RewardMetrics) -> f32 {
    (1.0 - metrics.f1.clamp(0.0, 1.0)) as f32
}

/// Build a `[tgt_len, batch, 1]` target from decoded sequences.
///
/// Row 0 holds `bos`, each column holds one decoded sequence right-padded
/// with `pad`. A sequence longer than `tgt_len - 1` is a contract violation.
pub fn synthetic_target(
    decoded: &[&[TokenId]],
    tgt_len: usize,
    bos: TokenId,
    pad: TokenId,
) -> Result<Array3<TokenId>> {
    if tgt_len == 0 {
        return Err(SeqTrainError::Contract("target length must be > 0".into()));
    }
    let mut target = Array3::from_elem((tgt_len, decoded.len(), 1), pad);
    for (b, seq) in decoded.iter().enumerate() {
        if seq.len() > tgt_len - 1 {
            return Err(SeqTrainError::Contract(format!(
                "decoded sequence of example {} has {} tokens, budget is {}",
                b,
                seq.len(),
                tgt_len - 1
            )));
        }
        target[[0, b, 0]] = bos;
        for (t, &tok) in seq.iter().enumerate() {
            target[[t + 1, b, 0]] = tok;
        }
    }
    Ok(target)
}

/// What one RL pass over a batch did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RewardSummary {
    pub beams: usize,
    pub examples: usize,
    /// Candidates scored by the evaluator.
    pub evaluated: usize,
    /// Evaluator failures that fell back to a neutral scale.
    pub fallbacks: usize,
    pub scale_sum: f64,
    pub loss: f64,
}

impl RewardSummary {
    pub fn mean_scale(&self) -> f64 {
        if self.examples == 0 {
            return 0.0;
        }
        self.scale_sum / self.examples as f64
    }
}

/// Runs the reward-weighted backward passes for one batch.
pub struct RewardShaper {
    evaluator: Box<dyn RewardEvaluator>,
    bos_idx: TokenId,
    padding_idx: TokenId,
}

impl RewardShaper {
    pub fn new(
        evaluator: Box<dyn RewardEvaluator>,
        bos_idx: TokenId,
        padding_idx: TokenId,
    ) -> Self {
        Self {
            evaluator,
            bos_idx,
            padding_idx,
        }
    }

    /// Loss weights for beam slot `b`, one per example.
    ///
    /// An empty candidate gets a neutral 1.0 without querying the evaluator,
    /// and so does a candidate whose evaluation fails.
    pub fn scales_for_beam(
        &mut self,
        beam: &BeamOutput,
        b: usize,
        summary: &mut RewardSummary,
    ) -> Vec<f32> {
        let mut scales = Vec::with_capacity(beam.decodings.len());
        for (i, decoding) in beam.decodings.iter().enumerate() {
            let hypothesis = decoding.tokens.get(b).map(Vec::as_slice).unwrap_or(&[]);
            if hypothesis.is_empty() {
                scales.push(1.0);
                continue;
            }

            let scale = match self.evaluator.evaluate(
                &decoding.source.join(" "),
                &hypothesis.join(" "),
                &decoding.reference.join(" "),
            ) {
                Ok(metrics) => {
                    summary.evaluated += 1;
                    reward_scale(&metrics)
                }
                Err(e) => {
                    summary.fallbacks += 1;
                    tracing::debug!(
                        example = i,
                        beam = b,
                        error = %e,
                        "Reward evaluation failed, using neutral scale"
                    );
                    1.0
                }
            };
            scales.push(scale);
        }
        scales
    }

    /// Backward pass for every beam slot of `beam` against `batch`.
    ///
    /// The batch target is replaced by each slot's synthetic target only for
    /// the duration of the loss computation.
    #[allow(clippy::too_many_arguments)]
    pub fn backward_beams<M, L, O>(
        &mut self,
        model: &mut M,
        loss_compute: &mut L,
        optimizer: &mut O,
        batch: &mut Batch,
        beam: &BeamOutput,
        normalization: usize,
        shard_size: usize,
    ) -> Result<RewardSummary>
    where
        M: Model,
        L: LossCompute<M>,
        O: Optimizer,
    {
        let tgt_len = batch.tgt_len();
        if beam.decodings.len() != batch.batch_size() {
            return Err(SeqTrainError::Contract(format!(
                "beam output decodes {} examples, batch has {}",
                beam.decodings.len(),
                batch.batch_size()
            )));
        }

        let mut summary = RewardSummary {
            beams: beam.beam_size(),
            ..Default::default()
        };

        for b in 0..beam.beam_size() {
            let (outputs, attns) = beam.select(b)?;
            if outputs.shape().first().copied() != Some(tgt_len.saturating_sub(1)) {
                return Err(SeqTrainError::Contract(format!(
                    "beam outputs have shape {:?}, target length is {}",
                    outputs.shape(),
                    tgt_len
                )));
            }

            let decoded: Vec<&[TokenId]> = beam
                .decodings
                .iter()
                .map(|d| d.token_ids.get(b).map(Vec::as_slice).unwrap_or(&[]))
                .collect();
            let target = synthetic_target(&decoded, tgt_len, self.bos_idx, self.padding_idx)?;
            let scales = self.scales_for_beam(beam, b, &mut summary);
            summary.examples += scales.len();
            summary.scale_sum += scales.iter().map(|&s| s as f64).sum::<f64>();

            let (loss, _stats) = {
                let shaped = batch.override_target(target)?;
                let request =
                    LossRequest::training(&shaped, normalization, shard_size).with_scales(scales);
                loss_compute.compute(model, &shaped, &outputs, &attns, &request)?
            };

            if model.has_decoder_state() {
                model.detach_decoder_state();
            }
            if let Some(loss) = loss {
                summary.loss += loss.value;
                optimizer.backward(model, loss)?;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attentions, ExampleDecoding, Tensor};
    use ndarray::IxDyn;

    struct FixedF1 {
        f1: f64,
        calls: usize,
        fail: bool,
    }

    impl RewardEvaluator for FixedF1 {
        fn evaluate(
            &mut self,
            _source: &str,
            _hypothesis: &str,
            _reference: &str,
        ) -> core::result::Result<RewardMetrics, RewardError> {
            self.calls += 1;
            if self.fail {
                return Err(RewardError::Unavailable("offline".into()));
            }
            Ok(RewardMetrics {
                f1: self.f1,
                exact_match: None,
            })
        }
    }

    fn beam(tokens: Vec<Vec<Vec<&str>>>) -> BeamOutput {
        let batch = tokens.len();
        let decodings = tokens
            .into_iter()
            .map(|per_beam| ExampleDecoding {
                token_ids: per_beam.iter().map(|t| vec![5; t.len()]).collect(),
                tokens: per_beam
                    .iter()
                    .map(|t| t.iter().map(|s| s.to_string()).collect())
                    .collect(),
                source: vec!["src".into()],
                reference: vec!["ref".into()],
            })
            .collect();
        BeamOutput {
            dec_outputs: Tensor::zeros(IxDyn(&[3, batch, 1, 2])),
            dec_attns: Attentions::new(),
            decodings,
        }
    }

    #[test]
    fn test_reward_scale_bounds() {
        for f1 in [0.0, 0.25, 0.5, 1.0, -0.3, 1.7] {
            let s = reward_scale(&RewardMetrics {
                f1,
                exact_match: None,
            });
            assert!((0.0..=1.0).contains(&s));
        }
        let s = reward_scale(&RewardMetrics {
            f1: 0.25,
            exact_match: Some(0.0),
        });
        assert_eq!(s, 0.75);
    }

    #[test]
    fn test_empty_candidate_skips_evaluator() {
        let mut shaper = RewardShaper::new(
            Box::new(FixedF1 {
                f1: 0.4,
                calls: 0,
                fail: false,
            }),
            2,
            1,
        );
        let beam = beam(vec![vec![vec![]], vec![vec!["a", "b"]]]);
        let mut summary = RewardSummary::default();
        let scales = shaper.scales_for_beam(&beam, 0, &mut summary);
        assert_eq!(scales, vec![1.0, 0.6]);
        assert_eq!(summary.evaluated, 1);
    }

    #[test]
    fn test_evaluator_failure_falls_back_to_neutral() {
        let mut shaper = RewardShaper::new(
            Box::new(FixedF1 {
                f1: 0.9,
                calls: 0,
                fail: true,
            }),
            2,
            1,
        );
        let beam = beam(vec![vec![vec!["x"]], vec![vec!["y"]]]);
        let mut summary = RewardSummary::default();
        let scales = shaper.scales_for_beam(&beam, 0, &mut summary);
        assert_eq!(scales, vec![1.0, 1.0]);
        assert_eq!(summary.fallbacks, 2);
        assert_eq!(summary.evaluated, 0);
    }

    #[test]
    fn test_synthetic_target_layout() {
        let a: &[TokenId] = &[7, 8];
        let b: &[TokenId] = &[];
        let c: &[TokenId] = &[9, 9, 9];
        let target = synthetic_target(&[a, b, c], 4, 2, 1).unwrap();
        assert_eq!(target.shape(), &[4, 3, 1]);

        let column = |i: usize| -> Vec<TokenId> { (0..4).map(|t| target[[t, i, 0]]).collect() };
        assert_eq!(column(0), vec![2, 7, 8, 1]);
        assert_eq!(column(1), vec![2, 1, 1, 1]);
        assert_eq!(column(2), vec![2, 9, 9, 9]);
    }

    #[test]
    fn test_synthetic_target_over_budget_is_fatal() {
        let long: &[TokenId] = &[3, 3, 3, 3];
        let err = synthetic_target(&[long], 4, 2, 1).unwrap_err();
        assert!(matches!(err, SeqTrainError::Contract(_)));
    }
}
