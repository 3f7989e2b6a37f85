//! Deterministic copy-task corpus.

use super::{BOS, EOS, FIRST_WORD, PAD};
use crate::batch::{Batch, TokenId};
use crate::utils::seeded_rng;
use ndarray::{Array2, Array3};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorpusConfig {
    /// Vocabulary size, special tokens included
    pub vocab_size: usize,
    pub batch_size: usize,
    pub num_batches: usize,
    pub min_len: usize,
    pub max_len: usize,
    pub seed: u64,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            vocab_size: 16,
            batch_size: 4,
            num_batches: 20,
            min_len: 2,
            max_len: 6,
            seed: 0,
        }
    }
}

impl CorpusConfig {
    pub fn with_batches(mut self, num_batches: usize, batch_size: usize) -> Self {
        self.num_batches = num_batches;
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Batches whose target repeats the source.
///
/// Target layout per example: start token, the source words, end token,
/// padding.
#[derive(Clone, Debug)]
pub struct SyntheticCorpus {
    config: CorpusConfig,
}

impl SyntheticCorpus {
    pub fn new(config: CorpusConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorpusConfig {
        &self.config
    }

    /// The same batches on every call.
    pub fn batches(&self) -> std::vec::IntoIter<Batch> {
        let mut rng = seeded_rng(Some(self.config.seed));
        (0..self.config.num_batches)
            .map(|_| self.sample_batch(&mut rng))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn sample_batch(&self, rng: &mut impl Rng) -> Batch {
        let c = &self.config;
        let max_len = c.max_len.max(1);
        let min_len = c.min_len.clamp(1, max_len);
        let hi = (c.vocab_size as TokenId).max(FIRST_WORD + 1);

        let sentences: Vec<Vec<TokenId>> = (0..c.batch_size)
            .map(|_| {
                let len = rng.gen_range(min_len..=max_len);
                (0..len).map(|_| rng.gen_range(FIRST_WORD..hi)).collect()
            })
            .collect();

        let src = Array2::from_shape_fn((max_len, c.batch_size), |(t, b)| {
            sentences[b].get(t).copied().unwrap_or(PAD)
        });
        let tgt = Array3::from_shape_fn((max_len + 2, c.batch_size, 1), |(t, b, _)| {
            let sentence = &sentences[b];
            if t == 0 {
                BOS
            } else if t <= sentence.len() {
                sentence[t - 1]
            } else if t == sentence.len() + 1 {
                EOS
            } else {
                PAD
            }
        });
        let lengths = sentences.iter().map(Vec::len).collect();
        Batch::new(src, tgt).with_src_lengths(lengths)
    }
}
