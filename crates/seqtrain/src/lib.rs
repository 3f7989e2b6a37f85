//! # seqtrain
//!
//! Training-loop mechanics for sequence generation models trained under a
//! hybrid supervised / reinforcement-learning regime.
//!
//! ## Overview
//!
//! seqtrain owns the *mechanism* of a training run and leaves the *strategy*
//! to its collaborators:
//! - `BatchAccumulator` groups a batch stream for gradient accumulation
//! - `GradientReducer` synchronizes normalization and gradients across workers
//! - `ExponentialAverage` keeps a moving average of the model parameters
//! - `RewardShaper` adds a reward-weighted RL objective over beam candidates
//! - `CheckpointScheduler` decides when checkpoints are written
//! - `Trainer` orchestrates all of the above plus validation
//!
//! The model, loss computation, optimizer, checkpoint saver, report manager
//! and reward evaluator are traits. The `toy` module ships small reference
//! implementations that are enough to drive the loop end to end.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use seqtrain::prelude::*;
//! use seqtrain::toy::{BigramDecoder, CorpusConfig, GeneratorLoss, Sgd, SyntheticCorpus};
//!
//! let config = TrainerConfig::default().with_train_steps(100);
//! let corpus = SyntheticCorpus::new(CorpusConfig::default());
//! let mut trainer = TrainerBuilder::new(config).build(
//!     BigramDecoder::new(16),
//!     GeneratorLoss::new(1),
//!     GeneratorLoss::new(1),
//!     Sgd::new(0.5),
//! )?;
//! let stats = trainer.train_only(corpus.batches())?;
//! ```

pub mod batch;
pub mod checkpoint;
pub mod log;
pub mod model;
pub mod report;
pub mod stats;
pub mod toy;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{Batch, TokenId};
    pub use crate::model::{
        Attentions, BeamOutput, ExampleDecoding, ForwardOutput, Model, Parameter, Parameterized,
        Tensor,
    };
    pub use crate::stats::Statistics;

    pub use crate::checkpoint::{CheckpointConfig, CheckpointSaver, CheckpointState, ModelSaver};
    pub use crate::log::{CompositeLogger, ConsoleLogger, MetricLogger};
    pub use crate::report::{LogReportManager, ReportManager};

    pub use crate::training::{
        AccumulationGroup, BatchAccumulator, CheckpointScheduler, Collectives, ExponentialAverage,
        GradientReducer, LocalGroup, Loss, LossCompute, LossRequest, MovingAverage, NormMethod,
        Optimizer, ParameterAverager, Precision, ReduceOp, RewardEvaluator, RewardMetrics,
        RewardShaper, RlStepMode, Trainer, TrainerBuilder, TrainerConfig,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum SeqTrainError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A programming-contract violation. Never recovered from.
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Collective communication failed: {0}")]
    Collective(#[from] training::CollectiveError),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Loss error: {0}")]
    Loss(String),

    #[error("Optimizer error: {0}")]
    Optimizer(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, SeqTrainError>;
