//! Scalar training and validation statistics.

use crate::training::{all_gather_list, Collectives};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Accumulator for loss, accuracy and throughput.
///
/// `merge` is commutative and associative over the counters, and an empty
/// `Statistics` is its identity, so partial results from any subset of
/// workers can be combined in any order. `start_time` belongs to the
/// receiving instance and is never merged.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Statistics {
    /// Sum of (unnormalized) losses.
    pub loss: f64,
    /// Target words scored.
    pub n_words: u64,
    /// Target words predicted correctly.
    pub n_correct: u64,
    pub n_src_words: u64,
    #[serde(skip, default = "Instant::now")]
    start_time: Instant,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Statistics {
    fn eq(&self, other: &Self) -> bool {
        self.loss == other.loss
            && self.n_words == other.n_words
            && self.n_correct == other.n_correct
            && self.n_src_words == other.n_src_words
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::with_counts(0.0, 0, 0)
    }

    pub fn with_counts(loss: f64, n_words: u64, n_correct: u64) -> Self {
        Self {
            loss,
            n_words,
            n_correct,
            n_src_words: 0,
            start_time: Instant::now(),
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Merge `other` into `self`.
    pub fn merge(&mut self, other: &Statistics) {
        self.loss += other.loss;
        self.n_words += other.n_words;
        self.n_correct += other.n_correct;
        self.n_src_words += other.n_src_words;
    }

    /// Gather `self` from every worker and sum the results.
    ///
    /// Every worker must call this at the same point; failures are fatal.
    pub fn all_gather(&self, collectives: &dyn Collectives) -> Result<Statistics> {
        let gathered: Vec<Statistics> = all_gather_list(collectives, self)?;
        let mut total = Statistics::new();
        total.start_time = self.start_time;
        for stat in &gathered {
            total.merge(stat);
        }
        Ok(total)
    }

    /// Percentage of correctly predicted target words.
    pub fn accuracy(&self) -> f64 {
        if self.n_words == 0 {
            return 0.0;
        }
        100.0 * self.n_correct as f64 / self.n_words as f64
    }

    /// Cross entropy per target word.
    pub fn xent(&self) -> f64 {
        if self.n_words == 0 {
            return 0.0;
        }
        self.loss / self.n_words as f64
    }

    /// Perplexity, capped to keep reports finite.
    pub fn ppl(&self) -> f64 {
        self.xent().min(100.0).exp()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    /// Named scalars for metric sinks.
    pub fn to_metrics(&self, prefix: &str) -> HashMap<String, f64> {
        let elapsed = self.elapsed_secs().max(1e-9);
        let mut metrics = HashMap::new();
        metrics.insert(format!("{}acc", prefix), self.accuracy());
        metrics.insert(format!("{}ppl", prefix), self.ppl());
        metrics.insert(format!("{}xent", prefix), self.xent());
        metrics.insert(format!("{}tgt_per_s", prefix), self.n_words as f64 / elapsed);
        metrics.insert(format!("{}src_per_s", prefix), self.n_src_words as f64 / elapsed);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(loss: f64, words: u64, correct: u64, src: u64) -> Statistics {
        let mut s = Statistics::with_counts(loss, words, correct);
        s.n_src_words = src;
        s
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = stats(1.5, 10, 7, 4);
        let b = stats(0.25, 3, 1, 9);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.n_words, 13);
        assert_eq!(ab.n_src_words, 13);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = stats(1.0, 1, 1, 1);
        let b = stats(2.0, 2, 2, 2);
        let c = stats(4.0, 4, 4, 4);

        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);

        let mut bc = b.clone();
        bc.merge(&c);
        let mut right = a.clone();
        right.merge(&bc);

        assert_eq!(left, right);
    }

    #[test]
    fn test_empty_is_identity() {
        let a = stats(3.0, 6, 5, 2);
        let mut merged = a.clone();
        merged.merge(&Statistics::new());
        assert_eq!(merged, a);

        let mut from_empty = Statistics::new();
        from_empty.merge(&a);
        assert_eq!(from_empty, a);
    }

    #[test]
    fn test_derived_metrics() {
        let s = stats(20.0, 10, 5, 0);
        assert_eq!(s.accuracy(), 50.0);
        assert_eq!(s.xent(), 2.0);
        assert!((s.ppl() - 2.0f64.exp()).abs() < 1e-12);

        let empty = Statistics::new();
        assert_eq!(empty.accuracy(), 0.0);
        assert_eq!(empty.ppl(), 1.0);
    }
}
