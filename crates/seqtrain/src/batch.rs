//! Training batches and scoped target replacement.

use crate::{Result, SeqTrainError};
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Vocabulary index of a token.
pub type TokenId = u32;

/// One unit from the upstream data pipeline.
///
/// Sequences are time-major: `src` and `history` are `[time, batch]`, the
/// target is `[time, batch, 1]` and starts with the start token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub src: Array2<TokenId>,
    pub src_lengths: Option<Vec<usize>>,
    pub history: Array2<TokenId>,
    pub history_lengths: Option<Vec<usize>>,
    tgt: Array3<TokenId>,
}

impl Batch {
    /// Create a batch whose history is the source itself.
    pub fn new(src: Array2<TokenId>, tgt: Array3<TokenId>) -> Self {
        Self {
            history: src.clone(),
            src,
            src_lengths: None,
            history_lengths: None,
            tgt,
        }
    }

    pub fn with_src_lengths(mut self, lengths: Vec<usize>) -> Self {
        self.src_lengths = Some(lengths);
        self
    }

    pub fn with_history(mut self, history: Array2<TokenId>, lengths: Option<Vec<usize>>) -> Self {
        self.history = history;
        self.history_lengths = lengths;
        self
    }

    /// Number of examples in the batch.
    pub fn batch_size(&self) -> usize {
        self.tgt.shape()[1]
    }

    /// Target length including the start token.
    pub fn tgt_len(&self) -> usize {
        self.tgt.shape()[0]
    }

    pub fn tgt(&self) -> &Array3<TokenId> {
        &self.tgt
    }

    /// Non-padding target tokens, not counting the leading start token.
    pub fn num_target_tokens(&self, padding_idx: TokenId) -> usize {
        if self.tgt_len() < 2 {
            return 0;
        }
        self.tgt
            .slice(s![1.., .., 0])
            .iter()
            .filter(|&&tok| tok != padding_idx)
            .count()
    }

    /// Total source words, when lengths are known.
    pub fn src_words(&self) -> Option<usize> {
        self.src_lengths.as_ref().map(|l| l.iter().sum())
    }

    /// Swap in `target` until the returned guard is dropped.
    ///
    /// The original target is restored on every exit path, including early
    /// returns through `?` and unwinding.
    pub fn override_target(&mut self, target: Array3<TokenId>) -> Result<TargetOverride<'_>> {
        let expected = [target.shape()[0], self.batch_size(), 1];
        if target.shape()[1..] != expected[1..] {
            return Err(SeqTrainError::ShapeMismatch {
                expected: expected.to_vec(),
                actual: target.shape().to_vec(),
            });
        }
        let saved = std::mem::replace(&mut self.tgt, target);
        Ok(TargetOverride { batch: self, saved })
    }
}

/// Guard returned by [`Batch::override_target`].
pub struct TargetOverride<'a> {
    batch: &'a mut Batch,
    saved: Array3<TokenId>,
}

impl TargetOverride<'_> {
    /// The target that will be put back.
    pub fn original_target(&self) -> &Array3<TokenId> {
        &self.saved
    }
}

impl Deref for TargetOverride<'_> {
    type Target = Batch;

    fn deref(&self) -> &Batch {
        self.batch
    }
}

impl Drop for TargetOverride<'_> {
    fn drop(&mut self) {
        std::mem::swap(&mut self.batch.tgt, &mut self.saved);
    }
}
