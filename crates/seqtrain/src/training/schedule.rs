//! Checkpoint cadence.

use super::config::TrainerConfig;

/// Decides when periodic checkpoints are written.
///
/// Before RL fine-tuning activates the supervised period applies, afterwards
/// the RL period. A period of 0 disables periodic saves for that phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointScheduler {
    supervised_period: u64,
    rl_period: u64,
    enable_rl_after: i64,
}

impl CheckpointScheduler {
    pub fn new(supervised_period: u64, rl_period: u64, enable_rl_after: i64) -> Self {
        Self {
            supervised_period,
            rl_period,
            enable_rl_after,
        }
    }

    pub fn from_config(config: &TrainerConfig) -> Self {
        Self::new(
            config.save_checkpoint_steps,
            config.rl_save_step,
            config.enable_rl_after,
        )
    }

    pub fn rl_phase(&self, step: u64) -> bool {
        self.enable_rl_after >= 0 && step as i64 > self.enable_rl_after
    }

    /// Period in effect at `step`.
    pub fn period(&self, step: u64) -> u64 {
        if self.rl_phase(step) {
            self.rl_period
        } else {
            self.supervised_period
        }
    }

    pub fn should_save(&self, step: u64) -> bool {
        match self.period(step) {
            0 => false,
            period => step % period == 0,
        }
    }
}
