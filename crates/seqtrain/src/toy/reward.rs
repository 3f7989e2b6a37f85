//! Token-overlap F1 reward.

use crate::training::{RewardError, RewardEvaluator, RewardMetrics};
use std::collections::HashMap;

/// Bag-of-tokens F1 between hypothesis and reference, after lowercasing and
/// stripping punctuation. Exact match compares the normalized token lists.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokenF1;

impl TokenF1 {
    pub fn new() -> Self {
        Self
    }

    fn normalize(text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|tok| {
                tok.chars()
                    .filter(|c| !c.is_ascii_punctuation())
                    .flat_map(char::to_lowercase)
                    .collect::<String>()
            })
            .filter(|tok| !tok.is_empty())
            .collect()
    }

    /// F1 of two token lists; two empty lists match perfectly.
    pub fn f1(hypothesis: &[String], reference: &[String]) -> f64 {
        if hypothesis.is_empty() || reference.is_empty() {
            return if hypothesis == reference { 1.0 } else { 0.0 };
        }
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for tok in reference {
            *counts.entry(tok.as_str()).or_default() += 1;
        }
        let mut common = 0usize;
        for tok in hypothesis {
            if let Some(n) = counts.get_mut(tok.as_str()) {
                if *n > 0 {
                    *n -= 1;
                    common += 1;
                }
            }
        }
        if common == 0 {
            return 0.0;
        }
        let precision = common as f64 / hypothesis.len() as f64;
        let recall = common as f64 / reference.len() as f64;
        2.0 * precision * recall / (precision + recall)
    }
}

impl RewardEvaluator for TokenF1 {
    fn evaluate(
        &mut self,
        _source: &str,
        hypothesis: &str,
        reference: &str,
    ) -> Result<RewardMetrics, RewardError> {
        let hypothesis = Self::normalize(hypothesis);
        let reference = Self::normalize(reference);
        Ok(RewardMetrics {
            f1: Self::f1(&hypothesis, &reference),
            exact_match: Some(if hypothesis == reference { 1.0 } else { 0.0 }),
        })
    }
}
