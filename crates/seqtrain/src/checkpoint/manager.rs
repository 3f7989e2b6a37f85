//! On-disk checkpoints with rotation.

use super::state::{CheckpointState, ModelSaver};
use crate::model::Parameterized;
use crate::training::MovingAverage;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

const PREFIX: &str = "checkpoint_step_";
const EXTENSION: &str = ".bin";

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory to store checkpoints
    pub checkpoint_dir: PathBuf,
    /// Keep only the last N checkpoints (0 = keep all)
    pub keep_last: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            keep_last: 5,
        }
    }
}

impl CheckpointConfig {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }

    pub fn keep_last(mut self, n: usize) -> Self {
        self.keep_last = n;
        self
    }
}

/// Writes `checkpoint_step_NNNNNN.bin` files and prunes old ones.
///
/// # Example
///
/// ```ignore
/// let saver = CheckpointSaver::new(CheckpointConfig::new("./checkpoints").keep_last(3))?;
/// let trainer = TrainerBuilder::new(config)
///     .saver(Box::new(saver))
///     .build(model, train_loss, valid_loss, optim)?;
///
/// // To resume:
/// let reader = CheckpointSaver::new(CheckpointConfig::new("./checkpoints"))?;
/// if let Some(state) = reader.load_latest()? {
///     state.restore_into(&mut model)?;
/// }
/// ```
pub struct CheckpointSaver {
    config: CheckpointConfig,
}

impl CheckpointSaver {
    /// Create the saver and its directory.
    pub fn new(config: CheckpointConfig) -> Result<Self> {
        fs::create_dir_all(&config.checkpoint_dir)?;
        Ok(Self { config })
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.config.checkpoint_dir
    }

    pub fn path_for_step(&self, step: u64) -> PathBuf {
        self.config
            .checkpoint_dir
            .join(format!("{}{:06}{}", PREFIX, step, EXTENSION))
    }

    /// Write `state` and rotate.
    pub fn write(&self, state: &CheckpointState) -> Result<PathBuf> {
        let path = self.path_for_step(state.step);
        fs::write(&path, state.to_bytes()?)?;
        tracing::info!(path = %path.display(), step = state.step, "Saved checkpoint");

        if self.config.keep_last > 0 {
            self.cleanup_old_checkpoints()?;
        }
        Ok(path)
    }

    /// Load the checkpoint with the highest step, if any.
    pub fn load_latest(&self) -> Result<Option<CheckpointState>> {
        match self.list_checkpoints()?.pop() {
            Some(path) => {
                let state = Self::load_from_path(&path)?;
                tracing::info!(path = %path.display(), step = state.step, "Loaded checkpoint");
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Load a specific checkpoint file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<CheckpointState> {
        let data = fs::read(path.as_ref())?;
        CheckpointState::from_bytes(&data)
    }

    /// All checkpoint files, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.config.checkpoint_dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| step_from_path(&p).map(|step| (step, p)))
            .collect();

        checkpoints.sort();
        Ok(checkpoints.into_iter().map(|(_, p)| p).collect())
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let mut checkpoints = self.list_checkpoints()?;

        while checkpoints.len() > self.config.keep_last {
            let old = checkpoints.remove(0);
            if let Err(e) = fs::remove_file(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(path = %old.display(), "Removed old checkpoint");
            }
        }

        Ok(())
    }
}

impl<M: Parameterized> ModelSaver<M> for CheckpointSaver {
    fn save(
        &mut self,
        step: u64,
        model: &M,
        average: Option<&MovingAverage>,
    ) -> Result<Option<PathBuf>> {
        let state = CheckpointState::capture(step, model, average);
        self.write(&state).map(Some)
    }
}

/// Step encoded in a checkpoint file name.
pub fn step_from_path(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(PREFIX))
        .and_then(|n| n.strip_suffix(EXTENSION))
        .and_then(|n| n.parse().ok())
}
