//! Training loop and its building blocks.
//!
//! Provides:
//! - `BatchAccumulator` - Groups batches for gradient accumulation
//! - `GradientReducer` - Cross-worker normalization and gradient reduction
//! - `ExponentialAverage` - Moving average of model parameters
//! - `RewardShaper` - Reward-weighted RL objective over beam candidates
//! - `CheckpointScheduler` - Checkpoint cadence
//! - `Trainer` - Main training loop

mod accumulate;
mod averaging;
mod config;
mod distributed;
mod loss;
mod optimizer;
mod reward;
mod schedule;
mod trainer;

pub use accumulate::{AccumulationGroup, BatchAccumulator};
pub use averaging::{
    decay_for_step, ExponentialAverage, MovingAverage, NoAverage, ParameterAverager,
};
pub use config::{NormMethod, Precision, ReduceOp, RlStepMode, TrainerConfig};
pub use distributed::{
    all_gather_list, CollectiveError, CollectiveReducer, Collectives, GradientReducer,
    LocalGroup, NoReduce, ThreadCollectives,
};
pub use loss::{Loss, LossCompute, LossRequest};
pub use optimizer::{clip_grad_norm, Optimizer};
pub use reward::{
    reward_scale, synthetic_target, RewardError, RewardEvaluator, RewardMetrics, RewardShaper,
    RewardSummary,
};
pub use schedule::CheckpointScheduler;
pub use trainer::{LoopState, Trainer, TrainerBuilder};
