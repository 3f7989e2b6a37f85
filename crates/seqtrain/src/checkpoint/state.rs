//! Checkpoint state and the saver contract.

use crate::model::{Parameterized, Tensor};
use crate::training::MovingAverage;
use crate::{Result, SeqTrainError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persists model snapshots on behalf of the trainer.
///
/// Only the primary worker holds a saver.
pub trait ModelSaver<M>: Send {
    /// Save `model` as of `step`, together with the moving average when one
    /// exists. Returns the written location, if any.
    fn save(
        &mut self,
        step: u64,
        model: &M,
        average: Option<&MovingAverage>,
    ) -> Result<Option<PathBuf>>;
}

/// A parameter value tagged with its name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub value: Tensor,
}

/// Complete model checkpoint.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckpointState {
    /// Last completed training step
    pub step: u64,
    /// Parameters in model iteration order
    pub parameters: Vec<NamedTensor>,
    /// Moving average, index-aligned with `parameters`
    pub moving_average: Option<MovingAverage>,
    /// Seconds since the Unix epoch at creation
    pub timestamp: String,
    /// seqtrain version that wrote the checkpoint
    pub version: String,
}

impl CheckpointState {
    /// Snapshot `model` at `step`.
    pub fn capture(step: u64, model: &dyn Parameterized, average: Option<&MovingAverage>) -> Self {
        let parameters = model
            .parameters()
            .into_iter()
            .map(|p| NamedTensor {
                name: p.name.clone(),
                value: p.value.clone(),
            })
            .collect();
        Self {
            step,
            parameters,
            moving_average: average.cloned(),
            timestamp: unix_timestamp(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Copy the stored parameter values into `model`.
    ///
    /// Names and shapes must line up with the model's parameters.
    pub fn restore_into(&self, model: &mut dyn Parameterized) -> Result<()> {
        let mut params = model.parameters_mut();
        if params.len() != self.parameters.len() {
            return Err(SeqTrainError::Checkpoint(format!(
                "checkpoint holds {} parameters, model has {}",
                self.parameters.len(),
                params.len()
            )));
        }
        for (param, stored) in params.iter_mut().zip(&self.parameters) {
            if param.name != stored.name {
                return Err(SeqTrainError::Checkpoint(format!(
                    "parameter '{}' found where '{}' was expected",
                    stored.name, param.name
                )));
            }
            if param.value.shape() != stored.value.shape() {
                return Err(SeqTrainError::ShapeMismatch {
                    expected: param.value.shape().to_vec(),
                    actual: stored.value.shape().to_vec(),
                });
            }
        }
        for (param, stored) in params.iter_mut().zip(&self.parameters) {
            param.value.assign(&stored.value);
        }
        Ok(())
    }

    /// Total number of scalar parameters stored.
    pub fn num_scalars(&self) -> usize {
        self.parameters.iter().map(|p| p.value.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameter;
    use ndarray::IxDyn;

    struct Params(Vec<Parameter>);

    impl Parameterized for Params {
        fn parameters(&self) -> Vec<&Parameter> {
            self.0.iter().collect()
        }
        fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
            self.0.iter_mut().collect()
        }
    }

    fn model(fill: f32) -> Params {
        Params(vec![
            Parameter::new("weight", Tensor::from_elem(IxDyn(&[2, 3]), fill)),
            Parameter::new("bias", Tensor::from_elem(IxDyn(&[3]), -fill)),
        ])
    }

    #[test]
    fn test_capture_and_restore() {
        let source = model(0.5);
        let avg = MovingAverage::from_parameters(&source);
        let state = CheckpointState::capture(12, &source, Some(&avg));
        assert_eq!(state.step, 12);
        assert_eq!(state.num_scalars(), 9);
        assert_eq!(state.version, crate::VERSION);

        let mut target = model(0.0);
        state.restore_into(&mut target).unwrap();
        assert_eq!(target.0[0].value, source.0[0].value);
        assert_eq!(target.0[1].value, source.0[1].value);
    }

    #[test]
    fn test_bincode_payload() {
        let state = CheckpointState::capture(3, &model(1.5), None);
        let restored = CheckpointState::from_bytes(&state.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_restore_rejects_other_layout() {
        let state = CheckpointState::capture(1, &model(1.0), None);
        let mut renamed = model(0.0);
        renamed.0[1].name = "other".into();
        assert!(matches!(
            state.restore_into(&mut renamed),
            Err(SeqTrainError::Checkpoint(_))
        ));

        let mut reshaped = model(0.0);
        reshaped.0[0].value = Tensor::zeros(IxDyn(&[3, 2]));
        assert!(matches!(
            state.restore_into(&mut reshaped),
            Err(SeqTrainError::ShapeMismatch { .. })
        ));
    }
}
