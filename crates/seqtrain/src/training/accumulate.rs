//! Grouping of the batch stream for gradient accumulation.

use super::config::{NormMethod, TrainerConfig};
use crate::batch::{Batch, TokenId};

/// Batches processed before one optimizer update.
#[derive(Clone, Debug)]
pub struct AccumulationGroup {
    pub batches: Vec<Batch>,
    /// Token or example count of the whole group; > 0 whenever a member batch
    /// has any examples (tokens mode) or at all (sentences mode).
    pub normalization: usize,
}

impl AccumulationGroup {
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

/// Lazily groups an upstream batch iterator.
///
/// Yields a group every `accum_count` batches, plus a trailing partial group
/// when the upstream runs dry. Consumes its source; not restartable.
pub struct BatchAccumulator<I> {
    source: I,
    accum_count: usize,
    norm_method: NormMethod,
    padding_idx: TokenId,
}

impl<I: Iterator<Item = Batch>> BatchAccumulator<I> {
    pub fn new(
        source: I,
        accum_count: usize,
        norm_method: NormMethod,
        padding_idx: TokenId,
    ) -> Self {
        Self {
            source,
            accum_count: accum_count.max(1),
            norm_method,
            padding_idx,
        }
    }

    pub fn from_config(source: I, config: &TrainerConfig) -> Self {
        Self::new(source, config.accum_count, config.norm_method, config.padding_idx)
    }

    fn contribution(&self, batch: &Batch) -> usize {
        match self.norm_method {
            NormMethod::Tokens => batch.num_target_tokens(self.padding_idx),
            NormMethod::Sents => batch.batch_size(),
        }
    }
}

impl<I: Iterator<Item = Batch>> Iterator for BatchAccumulator<I> {
    type Item = AccumulationGroup;

    fn next(&mut self) -> Option<AccumulationGroup> {
        let mut batches = Vec::with_capacity(self.accum_count);
        let mut normalization = 0;

        while batches.len() < self.accum_count {
            match self.source.next() {
                Some(batch) => {
                    normalization += self.contribution(&batch);
                    batches.push(batch);
                }
                None => break,
            }
        }

        if batches.is_empty() {
            None
        } else {
            Some(AccumulationGroup {
                batches,
                normalization,
            })
        }
    }
}
