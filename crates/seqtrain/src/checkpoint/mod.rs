//! Checkpoint persistence.
//!
//! Provides:
//! - `ModelSaver` trait the trainer saves through
//! - `CheckpointSaver` for on-disk checkpoints with rotation
//! - `CheckpointState` for the serialized model snapshot

mod manager;
mod state;

pub use manager::{step_from_path, CheckpointConfig, CheckpointSaver};
pub use state::{CheckpointState, ModelSaver, NamedTensor};
