//! Bigram decoder.
//!
//! The decoder state at each position is the one-hot encoding of the input
//! token, so all learning happens in the generator (`weight`, `bias`) that
//! [`super::GeneratorLoss`] applies on top of the outputs.

use super::{token_text, words, BOS, EOS, FIRST_WORD, PAD};
use crate::batch::{Batch, TokenId};
use crate::model::{
    Attentions, BeamOutput, ExampleDecoding, ForwardOutput, Model, Parameter, Parameterized, Tensor,
};
use crate::utils::seeded_rng;
use crate::{Result, SeqTrainError};
use ndarray::{s, Array1, ArrayViewMut1, IxDyn};
use rand::Rng;

pub const WEIGHT: &str = "generator.weight";
pub const BIAS: &str = "generator.bias";

#[derive(Clone, Debug)]
pub struct BigramDecoder {
    vocab_size: usize,
    beam_size: usize,
    params: Vec<Parameter>,
    training: bool,
}

impl BigramDecoder {
    /// Zero-initialized generator over `vocab_size` tokens, no beam search.
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            beam_size: 0,
            params: vec![
                Parameter::new(WEIGHT, Tensor::zeros(IxDyn(&[vocab_size, vocab_size]))),
                Parameter::new(BIAS, Tensor::zeros(IxDyn(&[vocab_size]))),
            ],
            training: true,
        }
    }

    /// Decode `beam_size` candidates per example during training passes.
    pub fn with_beam(mut self, beam_size: usize) -> Self {
        self.beam_size = beam_size;
        self
    }

    /// Uniform initialization in `[-0.1, 0.1)`.
    pub fn with_init_seed(mut self, seed: u64) -> Self {
        let mut rng = seeded_rng(Some(seed));
        for param in &mut self.params {
            param.value.mapv_inplace(|_| rng.gen_range(-0.1..0.1));
        }
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn beam_size(&self) -> usize {
        self.beam_size
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Generator scores for the token following `prev`.
    pub fn logits(&self, prev: TokenId) -> Array1<f32> {
        let weight = &self.params[0].value;
        let bias = &self.params[1].value;
        let row = weight.slice(s![prev as usize, ..]);
        let bias = bias.slice(s![..]);
        &row + &bias
    }

    fn check_token(&self, tok: TokenId) -> Result<usize> {
        let idx = tok as usize;
        if idx >= self.vocab_size {
            return Err(SeqTrainError::Model(format!(
                "token {} is outside a vocabulary of {}",
                tok, self.vocab_size
            )));
        }
        Ok(idx)
    }

    fn one_hot(&self, mut out: ArrayViewMut1<f32>, tok: TokenId) -> Result<()> {
        let idx = self.check_token(tok)?;
        out[idx] = 1.0;
        Ok(())
    }

    /// Tokens the decoder may emit, best first.
    fn ranked(&self, prev: TokenId) -> Vec<TokenId> {
        let logits = self.logits(prev);
        let mut candidates: Vec<TokenId> = (0..self.vocab_size as TokenId)
            .filter(|&tok| tok == EOS || tok >= FIRST_WORD)
            .collect();
        candidates.sort_by(|&a, &b| {
            logits[b as usize]
                .partial_cmp(&logits[a as usize])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
        candidates
    }

    /// Candidate `k`: the `k`-th best first token, then greedy. At most
    /// `max_tokens` tokens; the end token is not included.
    fn decode(&self, k: usize, max_tokens: usize) -> Vec<TokenId> {
        let mut out = Vec::with_capacity(max_tokens);
        let mut prev = BOS;
        while out.len() < max_tokens {
            let ranked = self.ranked(prev);
            let rank = if out.is_empty() { k } else { 0 };
            let next = match ranked.get(rank).or_else(|| ranked.first()) {
                Some(&tok) => tok,
                None => break,
            };
            if next == EOS {
                break;
            }
            out.push(next);
            prev = next;
        }
        out
    }

    fn uniform_attention(shape: &[usize]) -> Tensor {
        let src_len = shape.last().copied().unwrap_or(1).max(1);
        Tensor::from_elem(IxDyn(shape), 1.0 / src_len as f32)
    }

    fn beam_output(&self, batch: &Batch) -> Result<BeamOutput> {
        let (tgt_len, batch_size, beam) = (batch.tgt_len(), batch.batch_size(), self.beam_size);
        let steps = tgt_len.saturating_sub(1);
        let mut dec_outputs = Tensor::zeros(IxDyn(&[steps, batch_size, beam, self.vocab_size]));
        let mut decodings = Vec::with_capacity(batch_size);

        for b in 0..batch_size {
            let mut decoding = ExampleDecoding {
                source: words(batch.src.column(b).iter().copied()),
                reference: words(batch.tgt().slice(s![1.., b, 0]).iter().copied()),
                ..Default::default()
            };
            for k in 0..beam {
                let ids = self.decode(k, steps);
                for t in 0..steps {
                    let input = if t == 0 {
                        BOS
                    } else {
                        ids.get(t - 1).copied().unwrap_or(PAD)
                    };
                    self.one_hot(dec_outputs.slice_mut(s![t, b, k, ..]), input)?;
                }
                decoding.tokens.push(ids.iter().map(|&id| token_text(id)).collect());
                decoding.token_ids.push(ids);
            }
            decodings.push(decoding);
        }

        let mut dec_attns = Attentions::new();
        dec_attns.insert(
            "std".to_string(),
            Self::uniform_attention(&[steps, batch_size, beam, batch.src.nrows()]),
        );
        Ok(BeamOutput {
            dec_outputs,
            dec_attns,
            decodings,
        })
    }
}

impl Parameterized for BigramDecoder {
    fn parameters(&self) -> Vec<&Parameter> {
        self.params.iter().collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.params.iter_mut().collect()
    }
}

impl Model for BigramDecoder {
    fn forward(&mut self, batch: &Batch) -> Result<ForwardOutput> {
        let (tgt_len, batch_size) = (batch.tgt_len(), batch.batch_size());
        let steps = tgt_len.saturating_sub(1);
        let mut outputs = Tensor::zeros(IxDyn(&[steps, batch_size, self.vocab_size]));
        for t in 0..steps {
            for b in 0..batch_size {
                self.one_hot(outputs.slice_mut(s![t, b, ..]), batch.tgt()[[t, b, 0]])?;
            }
        }

        let mut attentions = Attentions::new();
        attentions.insert(
            "std".to_string(),
            Self::uniform_attention(&[steps, batch_size, batch.src.nrows()]),
        );

        let beam = if self.training && self.beam_size > 0 {
            Some(self.beam_output(batch)?)
        } else {
            None
        };

        Ok(ForwardOutput {
            outputs,
            attentions,
            beam,
        })
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
