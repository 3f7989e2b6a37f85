//! Trainer configuration.

use crate::batch::TokenId;
use crate::{Result, SeqTrainError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Denominator used to turn a summed loss into a per-unit loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormMethod {
    /// Non-padding target tokens, start token excluded.
    Tokens,
    /// Examples.
    Sents,
}

/// Working numeric precision of the model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
}

/// How reduced gradients are combined across workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    /// Sum of worker gradients.
    Sum,
    /// Sum divided by the world size.
    Average,
}

/// Whether the RL objective gets its own optimizer step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlStepMode {
    /// RL-flagged step after all beam slots, then the supervised step.
    Separate,
    /// RL gradients are folded into the supervised step.
    Shared,
}

/// Configuration for the trainer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    // Loop
    /// Stop after this many steps (0 or less runs until the source is exhausted)
    pub train_steps: i64,
    /// Validate every N steps
    pub valid_steps: u64,
    /// Emit a training report every N steps
    pub report_every: u64,
    /// Show a progress bar
    pub show_progress: bool,

    // Accumulation
    /// Batches per optimizer update
    pub accum_count: usize,
    pub norm_method: NormMethod,
    /// Truncated BPTT length (must be 0 when accumulating)
    pub trunc_size: usize,
    /// Loss shard size for full precision models
    pub max_generator_batches: usize,
    pub padding_idx: TokenId,
    pub bos_idx: TokenId,

    // Distributed
    pub world_size: usize,
    pub rank: usize,
    pub reduce_op: ReduceOp,
    /// Collective timeout in milliseconds
    pub collective_timeout_ms: u64,
    /// 0 = quiet, 1 = per-cycle, 2 = per-batch rank diagnostics
    pub verbose_level: u8,

    // Moving average
    /// Decay floor (0.0 disables averaging)
    pub average_decay: f64,
    /// Update the average every N accumulation cycles
    pub average_every: u64,
    pub model_dtype: Precision,

    // RL fine-tuning
    /// Enable RL after this step (negative disables)
    pub enable_rl_after: i64,
    /// Probability of the once-per-run RL trigger
    pub rl_trigger_probability: f64,
    pub rl_step_mode: RlStepMode,
    /// Seed for the RL trigger (entropy when absent)
    pub seed: Option<u64>,

    // Checkpointing
    /// Save every N steps before RL activation (0 disables)
    pub save_checkpoint_steps: u64,
    /// Save every N steps after RL activation (0 disables)
    pub rl_save_step: u64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            train_steps: 100_000,
            valid_steps: 10_000,
            report_every: 50,
            show_progress: false,

            accum_count: 1,
            norm_method: NormMethod::Sents,
            trunc_size: 0,
            max_generator_batches: 32,
            padding_idx: 1,
            bos_idx: 2,

            world_size: 1,
            rank: 0,
            reduce_op: ReduceOp::Average,
            collective_timeout_ms: 60_000,
            verbose_level: 0,

            average_decay: 0.0,
            average_every: 1,
            model_dtype: Precision::Fp32,

            enable_rl_after: -1,
            rl_trigger_probability: 0.2,
            rl_step_mode: RlStepMode::Separate,
            seed: None,

            save_checkpoint_steps: 5_000,
            rl_save_step: 1_000,
        }
    }
}

impl TrainerConfig {
    /// Load a JSON config; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: TrainerConfig = serde_json::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the construction-time invariants.
    pub fn validate(&self) -> Result<()> {
        if self.accum_count == 0 {
            return Err(SeqTrainError::Config("accum_count must be > 0".into()));
        }
        if self.accum_count > 1 && self.trunc_size != 0 {
            return Err(SeqTrainError::Config(
                "to enable accumulated gradients, target sequence truncation must be disabled \
                 (trunc_size = 0)"
                    .into(),
            ));
        }
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(SeqTrainError::Config(format!(
                "rank {} is not valid for world size {}",
                self.rank, self.world_size
            )));
        }
        if !(0.0..=1.0).contains(&self.rl_trigger_probability) {
            return Err(SeqTrainError::Config(format!(
                "rl_trigger_probability {} is outside [0, 1]",
                self.rl_trigger_probability
            )));
        }
        if !(0.0..=1.0).contains(&self.average_decay) {
            return Err(SeqTrainError::Config(format!(
                "average_decay {} is outside [0, 1]",
                self.average_decay
            )));
        }
        if self.average_every == 0 || self.report_every == 0 || self.valid_steps == 0 {
            return Err(SeqTrainError::Config(
                "average_every, report_every and valid_steps must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Shard size handed to the loss; sharding is off for reduced precision.
    pub fn shard_size(&self) -> usize {
        match self.model_dtype {
            Precision::Fp32 => self.max_generator_batches,
            Precision::Fp16 => 0,
        }
    }

    /// Whether `step` falls in the RL fine-tuning phase.
    pub fn rl_phase(&self, step: u64) -> bool {
        self.enable_rl_after >= 0 && step as i64 > self.enable_rl_after
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    pub fn with_train_steps(mut self, steps: i64) -> Self {
        self.train_steps = steps;
        self
    }

    pub fn with_accum_count(mut self, count: usize) -> Self {
        self.accum_count = count;
        self
    }

    pub fn with_norm_method(mut self, method: NormMethod) -> Self {
        self.norm_method = method;
        self
    }

    pub fn with_valid_steps(mut self, steps: u64) -> Self {
        self.valid_steps = steps;
        self
    }

    pub fn with_checkpoint_steps(mut self, supervised: u64, rl: u64) -> Self {
        self.save_checkpoint_steps = supervised;
        self.rl_save_step = rl;
        self
    }

    pub fn with_average(mut self, decay: f64, every: u64) -> Self {
        self.average_decay = decay;
        self.average_every = every;
        self
    }

    /// Enable RL after `step` with the given trigger probability.
    pub fn with_rl(mut self, step: i64, probability: f64) -> Self {
        self.enable_rl_after = step;
        self.rl_trigger_probability = probability;
        self
    }

    pub fn with_world(mut self, world_size: usize, rank: usize) -> Self {
        self.world_size = world_size;
        self.rank = rank;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        TrainerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_accumulation_requires_no_truncation() {
        let mut config = TrainerConfig::default().with_accum_count(4);
        config.trunc_size = 20;
        assert!(matches!(config.validate(), Err(SeqTrainError::Config(_))));

        config.trunc_size = 0;
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_accum_and_bad_rank() {
        assert!(TrainerConfig::default().with_accum_count(0).validate().is_err());
        assert!(TrainerConfig::default().with_world(2, 2).validate().is_err());
    }

    #[test]
    fn test_shard_size_follows_precision() {
        let mut config = TrainerConfig::default();
        assert_eq!(config.shard_size(), 32);
        config.model_dtype = Precision::Fp16;
        assert_eq!(config.shard_size(), 0);
    }

    #[test]
    fn test_rl_phase() {
        let config = TrainerConfig::default().with_rl(50, 1.0);
        assert!(!config.rl_phase(50));
        assert!(config.rl_phase(51));
        assert!(!TrainerConfig::default().rl_phase(1_000_000));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TrainerConfig =
            serde_json::from_str(r#"{"accum_count": 2, "norm_method": "tokens"}"#).unwrap();
        assert_eq!(config.accum_count, 2);
        assert_eq!(config.norm_method, NormMethod::Tokens);
        assert_eq!(config.rl_trigger_probability, 0.2);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(&path, r#"{"train_steps": 7, "seed": 3}"#).unwrap();
        let config = TrainerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.train_steps, 7);
        assert_eq!(config.seed, Some(3));
    }
}
